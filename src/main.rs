use std::{env, path::PathBuf, process};

use jpegpool::{Backend, JpegFrontEnd, PoolConfig, UnitCapacity};

const USAGE: &str =
    "usage: jpegpool [--host] [--units N] [--capacity MACROBLOCKS] [--program FILE.wgsl] <image.jpg>...";

struct Options {
    config: PoolConfig,
    inputs: Vec<PathBuf>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut config = PoolConfig::default();
    let mut inputs = Vec::new();

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {flag}"))
        };
        match arg.as_str() {
            "--host" => config.backend = Backend::Host,
            "--units" => {
                let units = value("--units")?;
                match units.parse::<usize>() {
                    Ok(n) if n > 0 => config.units = Some(n),
                    _ => return Err(format!("invalid unit count '{units}'")),
                }
            }
            "--capacity" => {
                let capacity = value("--capacity")?;
                let macroblocks = capacity
                    .parse::<usize>()
                    .map_err(|_| format!("invalid capacity '{capacity}'"))?;
                config.unit_capacity =
                    UnitCapacity::new(macroblocks).map_err(|e| e.to_string())?;
            }
            "--program" => config.program = Some(value("--program")?.into()),
            flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
            path => inputs.push(PathBuf::from(path)),
        }
    }

    if inputs.is_empty() {
        return Err("no input images given".into());
    }
    Ok(Options { config, inputs })
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            eprintln!("{msg}");
            eprintln!("{USAGE}");
            process::exit(1);
        }
    };

    let program = options.config.program()?;
    let mut pool = options.config.open()?;
    log::info!(
        "{} units of {} macroblocks allocated",
        pool.unit_count(),
        pool.unit_capacity().macroblocks()
    );

    let profile = jpegpool::run(&options.inputs, JpegFrontEnd::new(), &mut *pool, &program)?;
    println!("{profile}");
    Ok(())
}
