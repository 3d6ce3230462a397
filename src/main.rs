use std::{path::PathBuf, time::Duration};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use pagespeed_quest::{
    config::Config,
    inventory::FormFactor,
    logging,
    playback::PlaybackProxy,
    proxy::{ProxySession, with_proxy},
    recording::RecordingProxy,
    throttle::ThrottleSettings,
    tools::{LighthouseRun, LoadshowRun},
};

const DEFAULT_PLAYBACK_MBPS: f64 = 1.6;

#[derive(Debug, Parser)]
#[command(name = "pagespeed-quest", version)]
struct Cli {
    /// Optional path to config TOML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, fatal, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run Lighthouse (performance category) through the proxy.
    Lighthouse {
        #[command(subcommand)]
        mode: LighthouseCommand,
    },
    /// Render a page-load video with loadshow through the proxy.
    Loadshow {
        #[command(subcommand)]
        mode: LoadshowCommand,
    },
    /// Serve the inventory through a playback proxy until interrupted.
    Proxy {
        /// Inventory directory.
        #[arg(short = 'd', long)]
        inventory_dir: Option<PathBuf>,
        /// Proxy port.
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
        /// Throttle network throughput (Mbps).
        #[arg(short, long)]
        throughput: Option<f64>,
    },
}

#[derive(Debug, Subcommand)]
enum LighthouseCommand {
    /// Record the page while Lighthouse loads it, without throttling.
    Recording {
        url: String,
        #[arg(short, long, value_enum, default_value_t = FormFactor::Mobile)]
        form_factor: FormFactor,
    },
    /// Replay the recorded page to Lighthouse.
    Playback {
        #[arg(short, long, default_value = "4")]
        cpu_multiplier: String,
        /// Throttle network throughput (Mbps).
        #[arg(short, long, default_value_t = DEFAULT_PLAYBACK_MBPS)]
        throughput: f64,
    },
}

#[derive(Debug, Subcommand)]
enum LoadshowCommand {
    /// Record the page while loadshow loads it.
    Recording {
        url: String,
        #[arg(short, long, value_enum, default_value_t = FormFactor::Mobile)]
        form_factor: FormFactor,
        #[arg(long, default_value_t = 60_000)]
        timeout_ms: u64,
    },
    /// Replay the recorded page to loadshow.
    Playback {
        /// Throttle network throughput (Mbps).
        #[arg(short, long, default_value_t = DEFAULT_PLAYBACK_MBPS)]
        throughput: f64,
        #[arg(long, default_value_t = 60_000)]
        timeout_ms: u64,
        /// Credit line rendered into the video.
        #[arg(long)]
        credit: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref() {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    logging::init(&config, cli.log_level.as_deref())?;

    let result = match cli.command {
        Command::Lighthouse { mode } => run_lighthouse(&config, mode).await,
        Command::Loadshow { mode } => run_loadshow(&config, mode).await,
        Command::Proxy {
            inventory_dir,
            port,
            throughput,
        } => run_proxy(&config, inventory_dir, port, throughput).await,
    };
    if let Err(err) = &result {
        tracing::error!("{err:#}");
    }
    result
}

fn recording_session(
    config: &Config,
    url: &str,
    form_factor: FormFactor,
) -> anyhow::Result<ProxySession<RecordingProxy>> {
    let repository = config.inventory_repository(None)?;
    let handler = RecordingProxy::new(repository)?
        .with_entry_url(url)
        .with_device_type(form_factor);
    Ok(ProxySession::new(handler, config.proxy_options(None)?))
}

fn playback_session(
    config: &Config,
    throughput: Option<f64>,
    inventory_dir: Option<PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<ProxySession<PlaybackProxy>> {
    let repository = config.inventory_repository(inventory_dir.as_deref())?;
    let mut options = config.proxy_options(throughput.map(ThrottleSettings::from_mbps))?;
    if port.is_some() {
        options.port = port;
    }
    Ok(ProxySession::new(PlaybackProxy::new(repository), options))
}

fn entry_url_of(handler: &PlaybackProxy) -> anyhow::Result<String> {
    handler
        .entry_url()
        .context("inventory has no entry URL; record the page first")
}

async fn run_lighthouse(config: &Config, mode: LighthouseCommand) -> anyhow::Result<()> {
    match mode {
        LighthouseCommand::Recording { url, form_factor } => {
            let mut session = recording_session(config, &url, form_factor)?;
            with_proxy(&mut session, |port| async move {
                let mut run = LighthouseRun::new(url, port);
                run.form_factor = form_factor;
                run.no_throttling = true;
                run.run().await?;
                tracing::info!("Lighthouse completed. Saving inventory...");
                Ok(())
            })
            .await
        }
        LighthouseCommand::Playback {
            cpu_multiplier,
            throughput,
        } => {
            let mut session = playback_session(config, Some(throughput), None, None)?;
            let handler = session.shared_handler();
            with_proxy(&mut session, |port| async move {
                let mut run = LighthouseRun::new(entry_url_of(&handler)?, port);
                run.form_factor = handler.device_type().unwrap_or(FormFactor::Mobile);
                run.cpu_multiplier = Some(cpu_multiplier);
                run.view = true;
                run.run().await?;
                tracing::info!("Lighthouse completed");
                Ok(())
            })
            .await
        }
    }
}

async fn run_loadshow(config: &Config, mode: LoadshowCommand) -> anyhow::Result<()> {
    match mode {
        LoadshowCommand::Recording {
            url,
            form_factor,
            timeout_ms,
        } => {
            let mut session = recording_session(config, &url, form_factor)?;
            with_proxy(&mut session, |port| async move {
                let mut run = LoadshowRun::new(url, port);
                run.form_factor = form_factor;
                run.timeout = Duration::from_millis(timeout_ms);
                run.run().await?;
                tracing::info!("loadshow completed. Saving inventory...");
                Ok(())
            })
            .await
        }
        LoadshowCommand::Playback {
            throughput,
            timeout_ms,
            credit,
        } => {
            let mut session = playback_session(config, Some(throughput), None, None)?;
            let handler = session.shared_handler();
            with_proxy(&mut session, |port| async move {
                let mut run = LoadshowRun::new(entry_url_of(&handler)?, port);
                run.form_factor = handler.device_type().unwrap_or(FormFactor::Mobile);
                run.timeout = Duration::from_millis(timeout_ms);
                run.credit = credit;
                run.run().await?;
                tracing::info!("loadshow completed");
                Ok(())
            })
            .await
        }
    }
}

async fn run_proxy(
    config: &Config,
    inventory_dir: Option<PathBuf>,
    port: u16,
    throughput: Option<f64>,
) -> anyhow::Result<()> {
    let mut session = playback_session(config, throughput, inventory_dir, Some(port))?;
    with_proxy(&mut session, |port| async move {
        tracing::info!(port, "playback proxy listening; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("wait for Ctrl-C")?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Cli, Command, LighthouseCommand, LoadshowCommand};
    use pagespeed_quest::inventory::FormFactor;

    #[test]
    fn lighthouse_recording_parses_url_and_form_factor() {
        let cli = Cli::try_parse_from([
            "pagespeed-quest",
            "lighthouse",
            "recording",
            "https://www.example.com/",
            "--form-factor",
            "desktop",
        ])
        .expect("cli should parse");

        match cli.command {
            Command::Lighthouse {
                mode: LighthouseCommand::Recording { url, form_factor },
            } => {
                assert_eq!(url, "https://www.example.com/");
                assert_eq!(form_factor, FormFactor::Desktop);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn lighthouse_playback_defaults() {
        let cli = Cli::try_parse_from(["pagespeed-quest", "lighthouse", "playback"]).unwrap();
        match cli.command {
            Command::Lighthouse {
                mode:
                    LighthouseCommand::Playback {
                        cpu_multiplier,
                        throughput,
                    },
            } => {
                assert_eq!(cpu_multiplier, "4");
                assert_eq!(throughput, 1.6);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn loadshow_playback_accepts_credit() {
        let cli = Cli::try_parse_from([
            "pagespeed-quest",
            "loadshow",
            "playback",
            "--credit",
            "Example Inc.",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Loadshow {
                mode: LoadshowCommand::Playback { credit: Some(ref credit), .. },
            } if credit == "Example Inc."
        ));
    }

    #[test]
    fn proxy_accepts_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pagespeed-quest",
            "proxy",
            "-d",
            "captures",
            "--throughput",
            "5",
            "--log-level",
            "debug",
            "--config",
            "pagespeed-quest.toml",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("pagespeed-quest.toml")));
        match cli.command {
            Command::Proxy {
                inventory_dir,
                port,
                throughput,
            } => {
                assert_eq!(inventory_dir, Some(PathBuf::from("captures")));
                assert_eq!(port, 8080);
                assert_eq!(throughput, Some(5.0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
