//! gemm: run a matmul pipeline on the simulated device and check it against
//! a host reference.

use std::process;
use std::time::Instant;

use clap::Parser;
use half::f16;
use serde::Serialize;

use strata_npu_kernels::coord::GemmCoord;
use strata_npu_kernels::gemm::scheduler::SwizzleDirection;
use strata_npu_kernels::layout::RowMajor;
use strata_npu_kernels::{
    launch, ArchSpec, GmTensor, LaunchGeometry, MatmulParams, OptimizedMatmul, TileConfig,
};

#[derive(Parser)]
#[command(name = "gemm", about = "Run a tiled matmul on the simulated device")]
struct Args {
    /// Problem rows
    #[arg(short = 'm', long, default_value = "256")]
    m: u32,

    /// Problem columns
    #[arg(short = 'n', long, default_value = "256")]
    n: u32,

    /// Reduction extent
    #[arg(short = 'k', long, default_value = "256")]
    k: u32,

    /// Block tile as m,n,k
    #[arg(long, default_value = "64,64,64", value_parser = parse_tile)]
    tile: GemmCoord,

    /// Matrix cores to launch
    #[arg(short = 'c', long, default_value = "4")]
    cores: u32,

    /// Swizzle band width
    #[arg(long, default_value = "3")]
    swizzle: u32,

    /// Swizzle direction: zn or nz
    #[arg(long, default_value = "zn", value_parser = parse_direction)]
    direction: SwizzleDirection,

    /// Seed for the operand generator
    #[arg(short = 's', long, default_value = "1")]
    seed: u64,

    /// Comparison tolerance against the host reference
    #[arg(long, default_value = "0.1")]
    tol: f32,

    /// Skip the host reference check
    #[arg(long)]
    no_verify: bool,

    /// Output format: text or json
    #[arg(long, default_value = "text", value_parser = validate_output_format)]
    output_format: String,

    /// Suppress all logging
    #[arg(long)]
    log_disable: bool,
}

fn parse_tile(s: &str) -> Result<GemmCoord, String> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| e.to_string()))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [m, n, k] => Ok(GemmCoord::new(*m, *n, *k)),
        _ => Err(format!("expected m,n,k, got '{}'", s)),
    }
}

fn parse_direction(s: &str) -> Result<SwizzleDirection, String> {
    match s {
        "zn" => Ok(SwizzleDirection::Zn),
        "nz" => Ok(SwizzleDirection::Nz),
        _ => Err(format!("Unknown swizzle direction '{}'. Options: zn, nz", s)),
    }
}

fn validate_output_format(s: &str) -> Result<String, String> {
    match s {
        "text" | "json" => Ok(s.to_string()),
        _ => Err(format!("Unknown output format '{}'. Options: text, json", s)),
    }
}

fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Serialize)]
struct Timings {
    launch_ms: f64,
    verify_ms: f64,
    total_ms: f64,
    gflops: f64,
}

#[derive(Serialize)]
struct JsonOutput {
    m: u32,
    n: u32,
    k: u32,
    tile: [u32; 3],
    cores: u32,
    verified: bool,
    max_abs_err: Option<f32>,
    timings: Timings,
}

/// xorshift64*; matches nothing in particular, just deterministic.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Rng(seed.wrapping_mul(0x9E3779B97F4A7C15) | 1)
    }

    fn next_f16(&mut self) -> f16 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        f16::from_f32((x >> 40) as f32 / (1u64 << 24) as f32 - 0.5)
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_disable);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let problem = GemmCoord::new(args.m, args.n, args.k);
    let arch = ArchSpec::atlas_a2();
    let config = TileConfig::new(args.tile, args.tile.k().min(64));
    let kernel: OptimizedMatmul<f16, false, true> = OptimizedMatmul::new(arch, config)?;

    let mut rng = Rng::new(args.seed);
    let a: Vec<f16> = (0..problem.m() * problem.k())
        .map(|_| rng.next_f16())
        .collect();
    let b: Vec<f16> = (0..problem.k() * problem.n())
        .map(|_| rng.next_f16())
        .collect();

    let params = MatmulParams {
        problem,
        a: GmTensor::from_vec(a.clone()),
        a_layout: RowMajor::new(problem.m(), problem.k()),
        b: GmTensor::from_vec(b.clone()),
        b_layout: RowMajor::new(problem.k(), problem.n()),
        d: GmTensor::new((problem.m() * problem.n()) as usize),
        d_layout: RowMajor::new(problem.m(), problem.n()),
        swizzle_offset: args.swizzle,
        direction: args.direction,
    };

    let total_start = Instant::now();
    let launch_start = Instant::now();
    launch(&arch, LaunchGeometry::new(args.cores), &kernel, &params)?;
    let launch_ms = launch_start.elapsed().as_secs_f64() * 1000.0;

    let verify_start = Instant::now();
    let max_abs_err = if args.no_verify {
        None
    } else {
        let d = params.d.to_vec();
        let (m, n, k) = (
            problem.m() as usize,
            problem.n() as usize,
            problem.k() as usize,
        );
        let mut worst = 0.0f32;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += a[i * k + p].to_f32() * b[p * n + j].to_f32();
                }
                worst = worst.max((d[i * n + j].to_f32() - acc).abs());
            }
        }
        Some(worst)
    };
    let verify_ms = verify_start.elapsed().as_secs_f64() * 1000.0;
    let total_ms = total_start.elapsed().as_secs_f64() * 1000.0;

    let flops = 2.0 * problem.m() as f64 * problem.n() as f64 * problem.k() as f64;
    let gflops = flops / (launch_ms / 1000.0) / 1e9;
    let verified = max_abs_err.map(|e| e <= args.tol).unwrap_or(true);

    match args.output_format.as_str() {
        "json" => {
            let json = JsonOutput {
                m: args.m,
                n: args.n,
                k: args.k,
                tile: [args.tile.m(), args.tile.n(), args.tile.k()],
                cores: args.cores,
                verified,
                max_abs_err,
                timings: Timings {
                    launch_ms,
                    verify_ms,
                    total_ms,
                    gflops,
                },
            };
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        _ => {
            println!(
                "{}x{}x{} tile {}x{}x{} on {} cores: {:.1} ms ({:.2} GFLOP/s)",
                args.m,
                args.n,
                args.k,
                args.tile.m(),
                args.tile.n(),
                args.tile.k(),
                args.cores,
                launch_ms,
                gflops
            );
            match max_abs_err {
                Some(err) => println!("max abs err {:.4} (tol {})", err, args.tol),
                None => println!("verification skipped"),
            }
        }
    }

    if !verified {
        return Err(format!(
            "result mismatch: max abs err {} over tolerance {}",
            max_abs_err.unwrap_or(f32::NAN),
            args.tol
        )
        .into());
    }
    Ok(())
}
