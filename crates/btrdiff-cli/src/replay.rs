//! `btrdiff replay`: rebuild subvolumes and list their contents.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use btrdiff_config::{log_cli_info, Config};
use btrdiff_stream::Timespec;
use btrdiff_subvol::{replay_streams, ReplayOptions, SubvolumeSet};

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Send-stream files, replayed in order into one set of subvolumes
    #[arg(value_name = "STREAM", required = true)]
    streams: Vec<PathBuf>,

    /// Drop security.selinux xattrs (limited to the configured values, if any)
    #[arg(long)]
    drop_selinux_xattrs: bool,

    /// Collapse utimes inside START:END (seconds[.nanoseconds]) to START
    #[arg(long, value_name = "START:END", value_parser = parse_window)]
    normalize_utimes: Option<(Timespec, Timespec)>,

    /// Reject commands with a larger payload
    #[arg(long)]
    max_command_len: Option<u32>,
}

impl ReplayArgs {
    fn options(&self, config: &Config) -> ReplayOptions {
        let drop_selinux = if self.drop_selinux_xattrs {
            Some(config.filters.selinux_values().unwrap_or_default())
        } else {
            config.filters.selinux_values()
        };
        ReplayOptions {
            max_command_len: self
                .max_command_len
                .unwrap_or(config.decode.max_command_len),
            drop_selinux,
            normalize_utimes: self.normalize_utimes,
        }
    }
}

pub fn run(args: ReplayArgs, config: &Config) -> Result<()> {
    let options = args.options(config);
    let mut set = SubvolumeSet::new();
    let mut order = Vec::new();

    for path in &args.streams {
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let uuids = replay_streams(&mut set, BufReader::new(file), &options)
            .with_context(|| format!("Failed to replay {}", path.display()))?;
        order.extend(uuids);
    }
    log_cli_info!("replayed", subvolumes = set.len());

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for uuid in order {
        let Some(subvolume) = set.get(uuid) else {
            continue;
        };
        let name = set
            .display_name(uuid)
            .unwrap_or_else(|| uuid.to_string());
        for (path, digest) in subvolume.listing() {
            writeln!(out, "{}\t{}\t{}", name, path.escape_ascii(), digest)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn parse_timespec(s: &str) -> Result<Timespec> {
    let (sec, frac) = s.split_once('.').unwrap_or((s, ""));
    let sec: i64 = sec
        .parse()
        .with_context(|| format!("invalid seconds in {s:?}"))?;
    if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        bail!("invalid nanoseconds in {s:?}");
    }
    let nsec = format!("{frac:0<9}")
        .parse()
        .with_context(|| format!("invalid nanoseconds in {s:?}"))?;
    Ok(Timespec { sec, nsec })
}

/// `START:END`, both inclusive.
fn parse_window(s: &str) -> Result<(Timespec, Timespec)> {
    let Some((start, end)) = s.split_once(':') else {
        bail!("expected START:END, got {s:?}");
    };
    let (start, end) = (parse_timespec(start)?, parse_timespec(end)?);
    if end < start {
        bail!("window {s:?} ends before it starts");
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window() {
        let (start, end) = parse_window("100:200.5").unwrap();
        assert_eq!(start, Timespec { sec: 100, nsec: 0 });
        assert_eq!(
            end,
            Timespec {
                sec: 200,
                nsec: 500_000_000
            }
        );
    }

    #[test]
    fn test_parse_window_rejects_garbage() {
        assert!(parse_window("100").is_err());
        assert!(parse_window("200:100").is_err());
        assert!(parse_window("1.2345678901:2").is_err());
        assert!(parse_window("a:b").is_err());
    }

    #[test]
    fn test_selinux_flag_overrides_config() {
        let args = ReplayArgs {
            streams: vec![PathBuf::from("x")],
            drop_selinux_xattrs: true,
            normalize_utimes: None,
            max_command_len: Some(4096),
        };
        let options = args.options(&Config::default());
        assert_eq!(options.drop_selinux, Some(Vec::new()));
        assert_eq!(options.max_command_len, 4096);

        let off = ReplayArgs {
            drop_selinux_xattrs: false,
            ..args
        };
        assert_eq!(off.options(&Config::default()).drop_selinux, None);
    }
}
