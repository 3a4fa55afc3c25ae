//! Kernel launch: spawns one OS thread per core and wires up the shared
//! flag hub.

use std::sync::Arc;
use std::thread;

use tracing::debug;

use crate::arch::{ArchSpec, CoreKind, EventTable, FlagHub, FlagId, Resource};
use crate::error::LaunchError;

/// How many cores a launch occupies.
#[derive(Debug, Clone, Copy)]
pub struct LaunchGeometry {
    pub aic_num: u32,
    pub aiv_per_aic: u32,
}

impl LaunchGeometry {
    /// `aic_num` matrix cores, each paired with two vector cores.
    pub const fn new(aic_num: u32) -> Self {
        LaunchGeometry {
            aic_num,
            aiv_per_aic: 2,
        }
    }

    pub const fn with_aiv_per_aic(mut self, aiv_per_aic: u32) -> Self {
        self.aiv_per_aic = aiv_per_aic;
        self
    }

    pub const fn aiv_num(&self) -> u32 {
        self.aic_num * self.aiv_per_aic
    }
}

/// Per-core execution context handed to a kernel's core program.
///
/// Owns the core's scratch and event table; the flag hub is shared with every
/// other core of the launch.
pub struct CoreCtx {
    kind: CoreKind,
    aic_idx: u32,
    aiv_idx: u32,
    aic_num: u32,
    pub resource: Resource,
    pub events: EventTable,
    hub: Arc<FlagHub>,
}

impl CoreCtx {
    #[inline]
    pub fn kind(&self) -> CoreKind {
        self.kind
    }

    /// Index of this core among cores of its kind.
    pub fn block_idx(&self) -> u32 {
        match self.kind {
            CoreKind::Aic => self.aic_idx,
            CoreKind::Aiv => self.aic_idx * self.hub.aiv_per_aic() + self.aiv_idx,
        }
    }

    /// Number of cores of this kind in the launch.
    pub fn block_num(&self) -> u32 {
        match self.kind {
            CoreKind::Aic => self.aic_num,
            CoreKind::Aiv => self.aic_num * self.hub.aiv_per_aic(),
        }
    }

    /// The AIC group this core belongs to.
    #[inline]
    pub fn group(&self) -> u32 {
        self.aic_idx
    }

    /// Index of this vector core within its group. Zero on a matrix core.
    #[inline]
    pub fn subblock_idx(&self) -> u32 {
        self.aiv_idx
    }

    #[inline]
    pub fn hub(&self) -> &FlagHub {
        &self.hub
    }

    /// Post `flag` to every vector core in this group. Matrix cores only.
    pub fn set_flag_to_aiv(&self, flag: FlagId) {
        debug_assert!(self.kind == CoreKind::Aic);
        self.hub.set_to_aiv(self.aic_idx, flag);
    }

    /// Consume one credit of `flag` posted by this group's matrix core.
    pub fn wait_flag_from_aic(&self, flag: FlagId) {
        debug_assert!(self.kind == CoreKind::Aiv);
        self.hub.wait_on_aiv(self.aic_idx, self.aiv_idx, flag);
    }

    /// Post `flag` toward this group's matrix core. Vector cores only.
    pub fn set_flag_to_aic(&self, flag: FlagId) {
        debug_assert!(self.kind == CoreKind::Aiv);
        self.hub.set_to_aic(self.aic_idx, self.aiv_idx, flag);
    }

    /// Consume one credit of `flag` from each paired vector core.
    pub fn wait_flag_from_aiv(&self, flag: FlagId) {
        debug_assert!(self.kind == CoreKind::Aic);
        self.hub.wait_on_aic(self.aic_idx, flag);
    }

    /// Rendezvous with every core of the same kind.
    pub fn barrier_same_kind(&self) {
        self.hub.barrier(self.kind);
    }

    /// Rendezvous with the other cores of this group.
    pub fn barrier_group(&self) {
        self.hub.barrier_group(self.aic_idx);
    }
}

/// A kernel as the device sees it: one program for the matrix cores and one
/// for the vector cores.
pub trait DeviceKernel: Sync {
    type Params: Send + Sync;

    fn run_aic(&self, ctx: &mut CoreCtx, params: &Self::Params);

    /// Vector-core program. Kernels that keep the vector cores idle leave
    /// the default body.
    fn run_aiv(&self, _ctx: &mut CoreCtx, _params: &Self::Params) {}
}

/// Run `kernel` across `geometry`, one OS thread per core.
///
/// Returns when every core program has finished. A panic in any core program
/// is reported as [`LaunchError::CoreFault`] naming the core.
pub fn launch<K: DeviceKernel>(
    arch: &ArchSpec,
    geometry: LaunchGeometry,
    kernel: &K,
    params: &K::Params,
) -> Result<(), LaunchError> {
    assert!(geometry.aic_num > 0, "launch needs at least one matrix core");
    debug!(
        aic_num = geometry.aic_num,
        aiv_per_aic = geometry.aiv_per_aic,
        "launching kernel"
    );
    let hub = Arc::new(FlagHub::new(geometry.aic_num, geometry.aiv_per_aic));

    let mut fault: Option<LaunchError> = None;
    thread::scope(|s| {
        let mut handles = Vec::new();
        for aic_idx in 0..geometry.aic_num {
            let aic_hub = Arc::clone(&hub);
            let name = format!("aic{}", aic_idx);
            handles.push((
                name,
                s.spawn(move || {
                    let mut ctx = CoreCtx {
                        kind: CoreKind::Aic,
                        aic_idx,
                        aiv_idx: 0,
                        aic_num: geometry.aic_num,
                        resource: Resource::new(arch, CoreKind::Aic),
                        events: EventTable::new(),
                        hub: aic_hub,
                    };
                    kernel.run_aic(&mut ctx, params);
                }),
            ));
            for aiv_idx in 0..geometry.aiv_per_aic {
                let hub = Arc::clone(&hub);
                let name = format!("aiv{}.{}", aic_idx, aiv_idx);
                handles.push((
                    name,
                    s.spawn(move || {
                        let mut ctx = CoreCtx {
                            kind: CoreKind::Aiv,
                            aic_idx,
                            aiv_idx,
                            aic_num: geometry.aic_num,
                            resource: Resource::new(arch, CoreKind::Aiv),
                            events: EventTable::new(),
                            hub,
                        };
                        kernel.run_aiv(&mut ctx, params);
                    }),
                ));
            }
        }
        for (name, handle) in handles {
            if let Err(payload) = handle.join() {
                let message = payload
                    .downcast_ref::<String>()
                    .cloned()
                    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                    .unwrap_or_else(|| "unknown panic".to_string());
                if fault.is_none() {
                    fault = Some(LaunchError::CoreFault {
                        core: name,
                        message,
                    });
                }
            }
        }
    });

    match fault {
        Some(err) => Err(err),
        None => {
            debug!("kernel finished");
            Ok(())
        }
    }
}
