use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use device_image::artifact::disk::partitions;
use device_image::artifact::disk::snapshot::convert_to_qcow2;
use device_image::build::pipeline::{build_image, BuildRequest};
use device_image::config::BuildConfig;
use device_image::description::{GadgetDescription, HardwareDescription};
use device_image::preflight::check_host_tools;
use device_image::{select_image, BuildContext, Image};
use tracing_subscriber::EnvFilter;

const GIB: u64 = 1024 * 1024 * 1024;

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "device_image=info";

fn usage() -> &'static str {
    "Usage:\n  device-image [--config <file>] build <hardware.yaml> <gadget.yaml> <payload.tar> <output.img> <size-GiB> [output.qcow2]\n  device-image [--config <file>] plan <hardware.yaml> <gadget.yaml> <size-GiB>\n  device-image [--config <file>] convert <raw.img> <output.qcow2>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, args) = match args.as_slice() {
        [flag, path, rest @ ..] if flag == "--config" => (
            BuildConfig::load(Path::new(path))
                .with_context(|| format!("loading config '{}'", path))?,
            rest,
        ),
        rest => (
            BuildConfig::load_default().context("loading default config")?,
            rest,
        ),
    };

    match args {
        [cmd, hardware, gadget, payload, output, size] if cmd == "build" => {
            build(&config, hardware, gadget, payload, output, size, None)
        }
        [cmd, hardware, gadget, payload, output, size, qcow2] if cmd == "build" => {
            build(&config, hardware, gadget, payload, output, size, Some(qcow2))
        }
        [cmd, hardware, gadget, size] if cmd == "plan" => plan(&config, hardware, gadget, size),
        [cmd, raw, qcow2] if cmd == "convert" => convert(&config, raw, qcow2),
        _ => bail!(usage()),
    }
}

fn parse_size(value: &str) -> Result<u64> {
    let gib: u64 = value
        .parse()
        .with_context(|| format!("invalid size '{}' (whole GiB expected)", value))?;
    if gib == 0 {
        bail!("image size must be at least 1 GiB");
    }
    gib.checked_mul(GIB)
        .ok_or_else(|| anyhow!("image size of {} GiB is too large", gib))
}

fn build(
    config: &BuildConfig,
    hardware: &str,
    gadget: &str,
    payload: &str,
    output: &str,
    size: &str,
    qcow2: Option<&String>,
) -> Result<()> {
    check_host_tools(&config.tools, qcow2.is_some())?;

    let request = BuildRequest {
        hardware: PathBuf::from(hardware),
        gadget: PathBuf::from(gadget),
        payload: PathBuf::from(payload),
        output: PathBuf::from(output),
        size_bytes: parse_size(size)?,
        qcow2: qcow2.map(PathBuf::from),
    };
    let ctx = BuildContext::host(config);
    let artifact = build_image(&ctx, config, &request)
        .with_context(|| format!("building image '{}'", output))?;

    println!("\n=== Image Built ===");
    println!("  Output: {}", artifact.display());
    Ok(())
}

fn plan(config: &BuildConfig, hardware: &str, gadget: &str, size: &str) -> Result<()> {
    let size_bytes = parse_size(size)?;
    let hardware = HardwareDescription::load(Path::new(hardware))?;
    let gadget = GadgetDescription::load(Path::new(gadget))?;
    let image = select_image(&hardware, &gadget, Path::new("image.img"), size_bytes, config)?;
    let plan = partitions::plan(image.disk().layout(), size_bytes)?;

    println!("Bootloader: {}", image.bootloader());
    println!("Partition table: {}", plan.label_type);
    for (i, part) in plan.partitions.iter().enumerate() {
        println!(
            "  {} {:<12} {:>10}s - {:>10}s  {:?}",
            i + 1,
            part.label,
            part.begin_sector,
            part.end_sector,
            part.filesystem
        );
    }
    println!("\nparted script:\n{}", plan.script());
    Ok(())
}

fn convert(config: &BuildConfig, raw: &str, qcow2: &str) -> Result<()> {
    check_host_tools(&config.tools, true)?;
    let ctx = BuildContext::host(config);
    convert_to_qcow2(&ctx, Path::new(raw), Path::new(qcow2), &config.snapshot_name)
        .with_context(|| format!("converting '{}'", raw))?;
    println!("  Output: {}", qcow2);
    Ok(())
}
