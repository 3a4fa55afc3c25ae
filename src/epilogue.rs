//! Vector-core block epilogues.
//!
//! The attention driver hands the f32 score rows to the vector cores, which
//! apply a scaled row softmax and write the probabilities back narrowed to
//! the operand type. Rows stream through the unified buffer one at a time.

use crate::arch::{EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource};
use crate::coord::MatrixCoord;
use crate::device::{Element, GmTensor};
use crate::error::LaunchError;
use crate::layout::{Layout, RowMajor};

const ROW_EVENT: EventId = EventId(0);

/// Row softmax of `scale * s` with a narrowing store.
pub struct SoftmaxRows<Out: Element> {
    ub_row: LocalTensor<f32>,
    ub_out: LocalTensor<Out>,
    cols_max: u32,
}

impl<Out: Element> SoftmaxRows<Out> {
    pub fn new(res: &mut Resource, cols_max: u32) -> Result<Self, LaunchError> {
        Ok(SoftmaxRows {
            ub_row: res.lease(PoolKind::Ub, cols_max)?,
            ub_out: res.lease(PoolKind::Ub, cols_max)?,
            cols_max,
        })
    }

    /// Softmax rows `row0 .. row0 + rows` of `src` into `dst`.
    ///
    /// Each row is shifted by its maximum before exponentiation, so large
    /// scores cannot overflow the exponential.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        res: &mut Resource,
        events: &mut EventTable,
        src: &GmTensor<f32>,
        src_layout: &RowMajor,
        row0: u32,
        rows: u32,
        cols: u32,
        scale: f32,
        dst: &GmTensor<Out>,
        dst_layout: &RowMajor,
    ) {
        assert!(cols <= self.cols_max, "row wider than the staging buffer");
        for r in row0..row0 + rows {
            src.with(|data| {
                for c in 0..cols {
                    let v = data[src_layout.offset(MatrixCoord::new(r, c)) as usize];
                    res.write(&self.ub_row, c, v * scale);
                }
            });
            events.set(HardEvent::Mte2V, ROW_EVENT);
            events.wait(HardEvent::Mte2V, ROW_EVENT);

            let mut max = f32::NEG_INFINITY;
            for c in 0..cols {
                max = max.max(res.read(&self.ub_row, c));
            }
            let mut sum = 0.0f32;
            for c in 0..cols {
                let e = (res.read(&self.ub_row, c) - max).exp();
                res.write(&self.ub_row, c, e);
                sum += e;
            }
            for c in 0..cols {
                let p = res.read(&self.ub_row, c) / sum;
                res.write(&self.ub_out, c, Out::from_f32(p));
            }

            dst.with_mut(|data| {
                for c in 0..cols {
                    data[dst_layout.offset(MatrixCoord::new(r, c)) as usize] =
                        res.read(&self.ub_out, c);
                }
            });
            events.set(HardEvent::VMte3, ROW_EVENT);
            events.wait(HardEvent::VMte3, ROW_EVENT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchSpec, CoreKind};
    use crate::test_utils::{naive_softmax_rows, random_f32};
    use half::f16;

    #[test]
    fn test_softmax_rows_match_reference() {
        let (rows, cols) = (5u32, 33u32);
        let s = GmTensor::from_vec(random_f32((rows * cols) as usize, 91));
        let p: GmTensor<f16> = GmTensor::new((rows * cols) as usize);
        let layout = RowMajor::new(rows, cols);

        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aiv);
        let mut events = EventTable::new();
        let stage: SoftmaxRows<f16> = SoftmaxRows::new(&mut res, cols).unwrap();
        stage.run(
            &mut res, &mut events, &s, &layout, 0, rows, cols, 0.25, &p, &layout,
        );
        events.assert_quiesced();

        let mut expect = s.to_vec();
        naive_softmax_rows(&mut expect, rows as usize, cols as usize, 0.25);
        for (i, (got, want)) in p.to_vec().iter().zip(expect.iter()).enumerate() {
            assert!(
                (got.to_f32() - want).abs() < 2e-3,
                "row softmax mismatch at {}: {} vs {}",
                i,
                got.to_f32(),
                want
            );
        }
    }

    #[test]
    fn test_softmax_large_scores_stay_finite() {
        let s = GmTensor::from_vec(vec![500.0f32, 501.0, 502.0, 503.0]);
        let p: GmTensor<f16> = GmTensor::new(4);
        let layout = RowMajor::new(1, 4);

        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aiv);
        let mut events = EventTable::new();
        let stage: SoftmaxRows<f16> = SoftmaxRows::new(&mut res, 4).unwrap();
        stage.run(&mut res, &mut events, &s, &layout, 0, 1, 4, 1.0, &p, &layout);
        events.assert_quiesced();

        let sum: f32 = p.to_vec().iter().map(|v| v.to_f32()).sum();
        assert!((sum - 1.0).abs() < 1e-2);
    }
}
