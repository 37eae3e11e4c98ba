use std::{
    fs,
    io::IsTerminal,
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};
use unscanny::{
    CaptureFailurePolicy, CycleOptions, Orchestrator, RunData, RunOutcome, Settings,
    clock::{Clock, SystemClock},
    console::{self, ConsoleMonitor},
    countdown::{AbortFlag, Unattended, WaitMonitor},
    device::{self, DEFAULT_DEVICE_PATTERN, DevicePattern, ScanimageDevice},
    orchestrator::DEFAULT_MAX_RETRIES,
    persist::TiffSink,
    power,
};

#[derive(Parser, Debug)]
#[command(name = "unscanny", version, about = "Time series imaging with flatbed and film scanners")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run a scanning series described by a settings file
    Run(RunArgs),
    /// print a settings file with default values
    Template(TemplateArgs),
    /// switch the scanner outlet by hand
    Power(PowerArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML file with [run], [scanner] and [power] sections
    settings_file: PathBuf,
    /// delay before the first scan in minutes, overrides the settings file
    #[arg(short, long)]
    delay: Option<u32>,
    /// use the SANE test backend instead of a real scanner
    #[arg(long)]
    test: bool,
    /// power-cycles to attempt when no scanner is found
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES,
          value_parser = clap::value_parser!(u32).range(0..=5))]
    max_retries: u32,
    /// case-insensitive pattern identifying the scanner
    #[arg(short = 's', long = "scanner", default_value = DEFAULT_DEVICE_PATTERN)]
    scanner_pattern: String,
    /// seconds to let the scanner boot after power-on
    #[arg(long, default_value_t = 30)]
    grace_period: u64,
    /// seconds to let the scanner settle before power-off
    #[arg(long, default_value_t = 30)]
    settle_period: u64,
    /// power-cycle and retry when a capture fails instead of stopping
    #[arg(long)]
    retry_capture: bool,
    /// directory receiving images and the run report
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,
    /// path of the scanimage program
    #[arg(long, default_value = "scanimage")]
    scanimage: PathBuf,
    /// start without asking for confirmation
    #[arg(short, long)]
    yes: bool,
}

#[derive(Args, Debug)]
struct TemplateArgs {
    /// write to this file instead of stdout
    outfile: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PowerArgs {
    /// settings file with the [power] section to use
    settings_file: PathBuf,
    #[command(subcommand)]
    action: PowerAction,
}

#[derive(Subcommand, Debug)]
enum PowerAction {
    /// power on an outlet (the configured one by default)
    On { outlet: Option<u8> },
    /// power off an outlet
    Off { outlet: Option<u8> },
    /// print 1 if the outlet is on, 0 otherwise
    Status { outlet: Option<u8> },
}

fn main() -> ExitCode {
    // console output
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry().with(console_layer).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Template(args) => template(args),
        Command::Power(args) => switch_power(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Exiting: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: RunArgs) -> Result<ExitCode> {
    let mut settings = Settings::load(&args.settings_file)?;
    if let Some(delay) = args.delay {
        settings.run.delay = delay;
    }
    let pattern = if args.test {
        settings.scanner = device::test_settings();
        DevicePattern::new(device::TEST_DEVICE)?
    } else {
        DevicePattern::new(&args.scanner_pattern)?
    };
    settings.validate()?;

    println!("\n{}", settings.summary());
    if !args.yes
        && !Confirm::new()
            .with_prompt("Are these settings correct?")
            .default(true)
            .interact()?
    {
        println!("Exiting: user indicated incorrect settings.");
        return Ok(ExitCode::SUCCESS);
    }

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("failed to create {}", args.output_dir.display()))?;

    let clock = SystemClock;
    let mut power = power::connect(&settings.power)?;
    let mut device = if args.test {
        ScanimageDevice::test_backend()
    } else {
        ScanimageDevice::new(args.scanimage.clone())
    };
    let mut sink = TiffSink::new(&args.output_dir);
    let abort = AbortFlag::new();
    console::install_interrupt_handler(&abort)?;
    let mut monitor: Box<dyn WaitMonitor> = if std::io::stdin().is_terminal() {
        Box::new(ConsoleMonitor::new(abort))
    } else {
        Box::new(Unattended::new(abort))
    };

    let mut options = CycleOptions::new(pattern);
    options.max_retries = args.max_retries;
    options.grace_period = Duration::from_secs(args.grace_period);
    options.settle_period = Duration::from_secs(args.settle_period);
    if args.retry_capture {
        options.capture_failure = CaptureFailurePolicy::PowerCycle;
    }

    let mut run_data = RunData::new(settings, clock.now());
    info!("run id {}", run_data.uid());
    let outcome = Orchestrator::new(
        power.as_mut(),
        &mut device,
        &mut sink,
        &clock,
        monitor.as_mut(),
        options,
    )
    .run(&mut run_data);
    // restore the terminal before printing the summary
    drop(monitor);

    let report = run_data.write_report(&args.output_dir)?;
    println!("Log file saved as: {}", report.display());

    match outcome {
        Ok(RunOutcome::Completed) => {
            println!("Completed {} scan(s).", run_data.scans_completed());
            Ok(ExitCode::SUCCESS)
        }
        Ok(RunOutcome::Aborted) => {
            println!(
                "Run aborted after {} of {} scan(s).",
                run_data.scans_completed(),
                run_data.run_settings().nscans
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!("{}", err);
            eprintln!("Exiting: {:#}", anyhow::Error::from(err));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn template(args: TemplateArgs) -> Result<ExitCode> {
    let toml = Settings::template().to_toml_string()?;
    match args.outfile {
        Some(path) => fs::write(&path, toml)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{}", toml),
    }
    Ok(ExitCode::SUCCESS)
}

fn switch_power(args: PowerArgs) -> Result<ExitCode> {
    let settings = Settings::load(&args.settings_file)?;
    let mut power = power::connect(&settings.power)?;
    let configured = settings.power.outlet;
    match args.action {
        PowerAction::On { outlet } => power.power_on(outlet.unwrap_or(configured))?,
        PowerAction::Off { outlet } => power.power_off(outlet.unwrap_or(configured))?,
        PowerAction::Status { outlet } => {
            let on = power.is_on(outlet.unwrap_or(configured))?;
            println!("{}", if on { "1" } else { "0" });
        }
    }
    Ok(ExitCode::SUCCESS)
}
