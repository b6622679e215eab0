use serde::Serialize;
use siphon_core::load_config;

use crate::{Cli, OutputFormat, Result};

#[derive(Serialize)]
struct ConfigReport {
    path: String,
    max_concurrent_downloads: usize,
    download_dir: String,
    proxy_enabled: bool,
    download_tool: String,
    site_strategies: usize,
}

pub fn check(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    let report = ConfigReport {
        path: cli.config.display().to_string(),
        max_concurrent_downloads: config.limits.capacity(),
        download_dir: config.paths.download_dir.display().to_string(),
        proxy_enabled: config.proxy.enabled,
        download_tool: config.download.tool.clone(),
        site_strategies: config.sites.len(),
    };
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("config: {}", report.path);
            println!("  concurrency: {}", report.max_concurrent_downloads);
            println!("  download dir: {}", report.download_dir);
            println!("  proxy: {}", if report.proxy_enabled { "on" } else { "off" });
            println!("  tool: {}", report.download_tool);
            println!("  site strategies: {}", report.site_strategies);
        }
    }
    Ok(())
}
