use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sparemap::{control, Config, Instance, LifecycleState};

const BUILD_TIMESTAMP: u64 = const_parse_u64(env!("BUILD_TIMESTAMP"));
const GIT_HASH: &str = env!("GIT_HASH");

const fn const_parse_u64(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut result: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        result = result * 10 + (bytes[i] - b'0') as u64;
        i += 1;
    }
    result
}

fn format_build_time() -> String {
    let secs = BUILD_TIMESTAMP;
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;
    let (year, month, day) = days_to_ymd(days_since_epoch);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year, month, day, hours, minutes, seconds
    )
}

fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let mut remaining = days as i64;
    let mut year = 1970i64;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining < days_in_year {
            break;
        }
        remaining -= days_in_year;
        year += 1;
    }

    let days_in_months: [i64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1i64;
    for days in days_in_months {
        if remaining < days {
            break;
        }
        remaining -= days;
        month += 1;
    }

    (year as u64, month as u64, (remaining + 1) as u64)
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

fn version_long() -> String {
    format!(
        "{} (built {} git:{})",
        env!("CARGO_PKG_VERSION"),
        format_build_time(),
        GIT_HASH
    )
}

#[derive(Parser)]
#[command(name = "sparemap")]
#[command(author, version, about = "Remap failing sectors on a main block device onto a spare", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct DevicePair {
    /// Path to the main device or image file
    main: String,
    /// Path to the spare device or image file
    spare: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Show detailed version and build information
    Version,

    /// Attach to (or initialize) a main/spare pair and print its status
    Status {
        #[command(flatten)]
        devices: DevicePair,
    },

    /// Attach and print I/O dispatch counters
    Stats {
        #[command(flatten)]
        devices: DevicePair,
    },

    /// Attach and reset the lookup cache's hit/miss counters
    ClearStats {
        #[command(flatten)]
        devices: DevicePair,
    },

    /// Attach and print a short health summary
    Health {
        #[command(flatten)]
        devices: DevicePair,
    },

    /// Attach and print lookup cache statistics
    CacheStats {
        #[command(flatten)]
        devices: DevicePair,
    },

    /// Attach and report a sector as failing, exercising the remap path
    SimulateFailure {
        #[command(flatten)]
        devices: DevicePair,

        /// Main-device sector number to remap
        sector: u64,
    },
}

fn attach(devices: &DevicePair) -> Result<std::sync::Arc<Instance>> {
    let config = Config::default();
    let instance = Instance::construct(&devices.main, &devices.spare, config)
        .with_context(|| format!("failed to attach {} / {}", devices.main, devices.spare))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while instance.state() == LifecycleState::Constructing && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    Ok(instance)
}

fn detach(instance: &Instance) {
    if instance.suspend().is_ok() {
        let _ = instance.destroy();
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("sparemap {}", version_long());
        }

        Commands::Status { devices } => {
            let instance = attach(&devices)?;
            println!("{}", control::handle(&instance, control::Command::Status));
            detach(&instance);
        }

        Commands::Stats { devices } => {
            let instance = attach(&devices)?;
            println!("{}", control::handle(&instance, control::Command::Stats));
            detach(&instance);
        }

        Commands::ClearStats { devices } => {
            let instance = attach(&devices)?;
            println!("{}", control::handle(&instance, control::Command::ClearStats));
            detach(&instance);
        }

        Commands::Health { devices } => {
            let instance = attach(&devices)?;
            println!("{}", control::handle(&instance, control::Command::Health));
            detach(&instance);
        }

        Commands::CacheStats { devices } => {
            let instance = attach(&devices)?;
            println!("{}", control::handle(&instance, control::Command::CacheStats));
            detach(&instance);
        }

        Commands::SimulateFailure { devices, sector } => {
            let instance = attach(&devices)?;
            instance
                .report_failure(sector, 1)
                .with_context(|| format!("failed to report sector {sector} as failing"))?;

            let deadline = Instant::now() + Duration::from_secs(5);
            while instance.active_remap_count() == 0 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }

            println!(
                "sector {} remap {}",
                sector,
                if instance.active_remap_count() > 0 {
                    "active"
                } else {
                    "still pending"
                }
            );
            detach(&instance);
        }
    }

    Ok(())
}
