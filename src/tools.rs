use std::{
    env,
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context as _, bail};
use tokio::process::Command;

use crate::inventory::FormFactor;

pub const LIGHTHOUSE_PATH_ENV: &str = "LIGHTHOUSE_PATH";
pub const LOADSHOW_PATH_ENV: &str = "LOADSHOW_PATH";
pub const DEFAULT_LIGHTHOUSE_PATH: &str = "./node_modules/.bin/lighthouse";
pub const DEFAULT_LOADSHOW_PATH: &str = "./node_modules/.bin/loadshow";
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";

/// Runs `program` with inherited stdio and fails unless it exits with 0.
pub async fn execute(program: impl AsRef<OsStr>, args: &[String]) -> anyhow::Result<()> {
    let program = program.as_ref();
    tracing::debug!(program = %program.to_string_lossy(), ?args, "executing external tool");
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("spawn {}", program.to_string_lossy()))?;
    if !status.success() {
        bail!("{} exited with {status}", program.to_string_lossy());
    }
    Ok(())
}

fn program_from_env(var: &str, default: &str) -> PathBuf {
    env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

pub fn lighthouse_program() -> PathBuf {
    program_from_env(LIGHTHOUSE_PATH_ENV, DEFAULT_LIGHTHOUSE_PATH)
}

pub fn loadshow_program() -> PathBuf {
    program_from_env(LOADSHOW_PATH_ENV, DEFAULT_LOADSHOW_PATH)
}

fn proxy_server_url(proxy_port: u16) -> String {
    format!("http://localhost:{proxy_port}")
}

/// A Lighthouse performance audit of `url` through the proxy on `proxy_port`.
#[derive(Debug, Clone)]
pub struct LighthouseRun {
    pub url: String,
    pub proxy_port: u16,
    pub form_factor: FormFactor,
    pub cpu_multiplier: Option<String>,
    /// Disables Lighthouse's simulated network and CPU throttling; used while
    /// recording so the inventory captures the real network.
    pub no_throttling: bool,
    pub view: bool,
    pub artifacts_dir: PathBuf,
}

impl LighthouseRun {
    pub fn new(url: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            url: url.into(),
            proxy_port,
            form_factor: FormFactor::Mobile,
            cpu_multiplier: None,
            no_throttling: false,
            view: false,
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
        }
    }

    pub fn args(&self) -> Vec<String> {
        let output_path = self.artifacts_dir.join("lighthouse");
        let mut args = vec![
            self.url.clone(),
            "--save-assets".to_owned(),
            "--output=html,json".to_owned(),
            format!("--output-path={}", output_path.display()),
            "--only-categories=performance".to_owned(),
            format!("--form-factor={}", self.form_factor.as_str()),
        ];

        if self.no_throttling {
            args.extend(
                [
                    "--throttling.rttMs=0",
                    "--throttling.throughputKbps=0",
                    "--throttling.downloadThroughputKbps=0",
                    "--throttling.uploadThroughputKbps=0",
                    "--throttling.cpuSlowdownMultiplier=1",
                ]
                .map(str::to_owned),
            );
        } else if let Some(multiplier) = self.cpu_multiplier.as_deref() {
            args.push(format!("--throttling.cpuSlowdownMultiplier={multiplier}"));
        }

        let chrome_flags = [
            "--ignore-certificate-errors".to_owned(),
            format!("--proxy-server={}", proxy_server_url(self.proxy_port)),
        ];
        args.push(format!("--chrome-flags=\"{}\"", chrome_flags.join(" ")));

        if self.view {
            args.push("--view".to_owned());
        }
        args
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        create_dir(&self.artifacts_dir).await?;
        execute(lighthouse_program(), &self.args()).await
    }
}

/// A loadshow page-load video of `url` through the proxy on `proxy_port`.
#[derive(Debug, Clone)]
pub struct LoadshowRun {
    pub url: String,
    pub proxy_port: u16,
    pub form_factor: FormFactor,
    pub timeout: Duration,
    pub credit: Option<String>,
    pub artifacts_dir: PathBuf,
}

#[derive(Debug, Default)]
struct LoadshowSpec<'a> {
    preset: Option<&'static str>,
    viewport_width: Option<u32>,
    columns: Option<u32>,
    cpu_throttling: Option<f64>,
    timeout_sec: Option<u64>,
    proxy_port: Option<u16>,
    credit: Option<&'a str>,
    debug_dir: Option<&'a Path>,
    output_summary: Option<&'a Path>,
}

impl LoadshowSpec<'_> {
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(preset) = self.preset {
            args.extend(["--preset".to_owned(), preset.to_owned()]);
        }
        if let Some(columns) = self.columns {
            args.extend(["--columns".to_owned(), columns.to_string()]);
        }
        if let Some(width) = self.viewport_width {
            args.extend(["--viewport-width".to_owned(), width.to_string()]);
        }
        if let Some(cpu_throttling) = self.cpu_throttling {
            args.extend(["--cpu-throttling".to_owned(), cpu_throttling.to_string()]);
        }
        if let Some(timeout_sec) = self.timeout_sec {
            args.extend(["--timeout-sec".to_owned(), timeout_sec.to_string()]);
        }
        if let Some(port) = self.proxy_port {
            args.extend([
                "--proxy-server".to_owned(),
                proxy_server_url(port),
                "--ignore-https-errors".to_owned(),
            ]);
        }
        if let Some(credit) = self.credit.filter(|credit| !credit.is_empty()) {
            args.extend(["--credit".to_owned(), credit.to_owned()]);
        }
        if let Some(dir) = self.debug_dir {
            args.extend(["--debug-dir".to_owned(), dir.display().to_string()]);
        }
        if let Some(summary) = self.output_summary {
            args.extend(["--output-summary".to_owned(), summary.display().to_string()]);
        }
        args
    }
}

impl LoadshowRun {
    pub fn new(url: impl Into<String>, proxy_port: u16) -> Self {
        Self {
            url: url.into(),
            proxy_port,
            form_factor: FormFactor::Mobile,
            timeout: Duration::from_secs(60),
            credit: None,
            artifacts_dir: PathBuf::from(DEFAULT_ARTIFACTS_DIR),
        }
    }

    fn loadshow_dir(&self) -> PathBuf {
        self.artifacts_dir.join("loadshow")
    }

    pub fn args(&self) -> Vec<String> {
        let loadshow_dir = self.loadshow_dir();
        let summary_path = loadshow_dir.join("summary.md");
        let output_path = self.artifacts_dir.join("loadshow.mp4");
        let (preset, columns) = match self.form_factor {
            FormFactor::Desktop => ("desktop", 2),
            FormFactor::Mobile => ("mobile", 3),
        };
        let spec = LoadshowSpec {
            preset: Some(preset),
            columns: Some(columns),
            timeout_sec: Some(self.timeout.as_millis().div_ceil(1000) as u64),
            proxy_port: Some(self.proxy_port),
            credit: self.credit.as_deref(),
            debug_dir: Some(&loadshow_dir),
            output_summary: Some(&summary_path),
            ..LoadshowSpec::default()
        };

        let mut args = vec!["record".to_owned()];
        args.extend(spec.to_args());
        args.extend([
            "--output".to_owned(),
            output_path.display().to_string(),
            self.url.clone(),
        ]);
        args
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        create_dir(&self.loadshow_dir()).await?;
        execute(loadshow_program(), &self.args()).await
    }
}

async fn create_dir(dir: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create artifacts dir {}", dir.display()))
}
