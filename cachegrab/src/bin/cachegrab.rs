use std::path::PathBuf;
use anyhow::{ bail, Context };
use clap::Parser;

use cachegrab::*;
use cachegrab::capture::{ RawEncoder, SampleEncoder };

/// Capture Prime+Probe samples of a victim command.
///
/// Each probe is given as SETSxWAYSxLINE (for example, '64x4x64'), and can
/// be restricted to a range of sets with START:END.
///
/// The victim runs on the target core under '/bin/sh -c'. By default only a
/// shim inside the victim (which opens the file named by $CACHEGRAB_TRIGGER)
/// opens the collection window; use '--trigger process' to sample for the
/// whole lifetime of the victim instead.
#[derive(Parser)]
#[command(verbatim_doc_comment)]
pub struct Args {
    /// The core being measured.
    #[arg(long)]
    target_cpu: usize,

    /// The core that drives collection.
    #[arg(long)]
    scope_cpu: usize,

    /// Attach an L1D probe with this shape.
    #[arg(long, value_parser = parse_shape)]
    l1d: Option<CacheShape>,

    /// Attach an L1I probe with this shape.
    #[arg(long, value_parser = parse_shape)]
    l1i: Option<CacheShape>,

    /// Attach a BTB probe with this shape.
    #[arg(long, value_parser = parse_shape)]
    btb: Option<CacheShape>,

    /// Sets measured by the L1D probe.
    #[arg(long, value_parser = parse_range)]
    l1d_sets: Option<ProbeConfig>,

    /// Sets measured by the L1I probe.
    #[arg(long, value_parser = parse_range)]
    l1i_sets: Option<ProbeConfig>,

    /// Sets measured by the BTB probe.
    #[arg(long, value_parser = parse_range)]
    btb_sets: Option<ProbeConfig>,

    /// Number of samples to prepare.
    #[arg(short, long, default_value_t = 10_000)]
    samples: usize,

    /// Delay (in nanoseconds) between samples.
    #[arg(long, default_value_t = CaptureConfig::DEFAULT_TIME_DELTA)]
    time_delta: u64,

    /// Attempts at collecting the first sample.
    #[arg(long, default_value_t = CaptureConfig::DEFAULT_TIMEOUT)]
    timeout: usize,

    /// Iterations before a stall thread gives up.
    #[arg(long, default_value_t = CaptureConfig::DEFAULT_STALL_CUTOFF)]
    stall_cutoff: u64,

    #[arg(long, value_enum, default_value_t = TriggerMode::Shim)]
    trigger: TriggerMode,

    /// Exported to the victim as $CACHEGRAB_NAME.
    #[arg(long, default_value = "")]
    name: String,

    /// Exported to the victim as $CACHEGRAB_COMMAND_BUF.
    #[arg(long, default_value = "")]
    command_buf: String,

    /// Set $CACHEGRAB_DEBUG=y for the victim.
    #[arg(long)]
    victim_debug: bool,

    /// Write raw per-probe data to this directory.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Print a hexdump of the first few samples of each probe.
    #[arg(long, default_value_t = 0)]
    dump: usize,

    /// Enable verbose output (repeat for more).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The victim command.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

fn parse_shape(s: &str) -> std::result::Result<CacheShape, String> {
    let parts: Vec<&str> = s.split('x').collect();
    if parts.len() != 3 {
        return Err(format!("expected SETSxWAYSxLINE, got '{}'", s));
    }
    let mut vals = [0usize; 3];
    for (v, p) in vals.iter_mut().zip(parts) {
        *v = p.trim().parse().map_err(|e| format!("'{}': {}", p, e))?;
    }
    Ok(CacheShape::new(vals[0], vals[1], vals[2]))
}

fn parse_range(s: &str) -> std::result::Result<ProbeConfig, String> {
    let (start, end) = s.split_once(':')
        .ok_or_else(|| format!("expected START:END, got '{}'", s))?;
    let start = start.trim().parse().map_err(|e| format!("'{}': {}", start, e))?;
    let end = end.trim().parse().map_err(|e| format!("'{}': {}", end, e))?;
    Ok(ProbeConfig::new(start, end))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let llv = match args.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let probes = [
        (ProbeKind::L1d, args.l1d, args.l1d_sets),
        (ProbeKind::L1i, args.l1i, args.l1i_sets),
        (ProbeKind::Btb, args.btb, args.btb_sets),
    ];
    if probes.iter().all(|(_, shape, _)| shape.is_none()) {
        bail!("No probes requested (use --l1d, --l1i or --btb)");
    }

    let mut session = SessionConfig::new()
        .xcall(CrossCallMode::Pinned)
        .build();
    session.create_scope(args.target_cpu, args.scope_cpu)
        .context("Couldn't create scope")?;

    for (kind, shape, sets) in probes {
        let shape = match shape {
            Some(shape) => shape,
            None => continue,
        };
        session.attach_probe(kind, shape)
            .with_context(|| format!("Couldn't attach {} probe", kind))?;
        if sets.is_some() {
            session.configure_probe(kind, sets)
                .with_context(|| format!("Couldn't configure {} probe", kind))?;
        }
        let info = session.get_probe_config(kind)?;
        println!("[*] {} probe: {} sets x {} ways x {} bytes, sets [{}, {})",
            kind, info.shape.num_sets, info.shape.associativity,
            info.shape.line_size, info.config.set_start, info.config.set_end);
    }

    let desc = session.sample_desc()?;
    println!("[*] {} bytes per sample", desc.total_size);

    let cfg = CaptureConfig::new(args.command.join(" "), args.samples)
        .time_delta(args.time_delta)
        .timeout(args.timeout)
        .stall_cutoff(args.stall_cutoff)
        .trigger(args.trigger)
        .name(args.name)
        .command_buf(args.command_buf.into_bytes())
        .debug(args.victim_debug);
    let out = session.capture(&cfg).context("Capture failed")?;

    println!("[*] Capture result: {}", out.result);
    println!("[*] Victim exit status: {:?}", out.status);
    println!("[*] Collected {} samples", out.nsamples);
    if !out.out_stream.is_empty() {
        println!("[*] Victim stdout:\n{}", String::from_utf8_lossy(&out.out_stream));
    }
    if !out.err_stream.is_empty() {
        println!("[*] Victim stderr:\n{}", String::from_utf8_lossy(&out.err_stream));
    }

    let data = match out.data {
        Some(data) => data,
        None => bail!("No data was retrieved ({})", out.result),
    };

    if args.dump > 0 {
        for (kind, pd) in data.iter() {
            println!("[*] {} ({} samples x {} sets):", kind, pd.sample_count, pd.sample_width);
            for (i, row) in pd.rows().take(args.dump).enumerate() {
                println!("  sample {}:\n{}", i, pretty_hex::pretty_hex(&row));
            }
        }
    }

    if let Some(dir) = args.out {
        let mut enc = RawEncoder::new(&dir);
        data.encode_with(&mut enc as &mut dyn SampleEncoder)
            .with_context(|| format!("Couldn't write to {}", dir.display()))?;
        for path in enc.written() {
            println!("[*] Wrote {}", path.display());
        }
    }

    session.destroy_scope();
    if !out.result.is_ok() {
        bail!("Capture finished with status '{}'", out.result);
    }
    Ok(())
}
