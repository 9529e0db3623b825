use clap::{Arg, ArgAction, Command};
use fuser::MountOption;
use log::{error, warn};
use std::path::Path;
use xmount::image::InputVariant;
use xmount::session::{self, SessionConfig};
use xmount::view::VirtualFormat;

fn main() {
    let mut cmd = Command::new("xmount")
        .version(env!("CARGO_PKG_VERSION"))
        .author("xmount-rs contributors")
        .about("Mounts a forensic disk image as a writable raw/VDI/VMDK virtual disk.")
        .disable_version_flag(true)
        .disable_help_flag(true)
        .arg(
            Arg::new("paths")
                .num_args(2..)
                .value_parser(clap::value_parser!(String))
                .help("One or more input image files, followed by the mount point."),
        )
        .arg(Arg::new("help").short('h').action(ArgAction::SetTrue))
        .arg(Arg::new("debug").short('d').action(ArgAction::SetTrue))
        .arg(Arg::new("single-threaded").short('s').action(ArgAction::SetTrue))
        .arg(
            Arg::new("mount-options")
                .short('o')
                .action(ArgAction::Append)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("in")
                .long("in")
                .value_parser(clap::value_parser!(String))
                .default_value("dd"),
        )
        .arg(
            Arg::new("out")
                .long("out")
                .value_parser(clap::value_parser!(String))
                .default_value("dd"),
        )
        .arg(
            Arg::new("cache")
                .long("cache")
                .visible_alias("rw")
                .value_parser(clap::value_parser!(String)),
        )
        .arg(Arg::new("owcache").long("owcache").value_parser(clap::value_parser!(String)))
        .arg(Arg::new("info").long("info").action(ArgAction::SetTrue))
        .arg(Arg::new("version").long("version").action(ArgAction::SetTrue));

    let matches = cmd.clone().get_matches();

    if matches.get_flag("help") {
        let _ = cmd.print_help();
        println!();
        std::process::exit(1);
    }

    if matches.get_flag("info") || matches.get_flag("version") {
        println!("xmount-rs {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }

    let debug = matches.get_flag("debug");
    env_logger::Builder::new()
        .filter_level(if debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let Some(paths) = matches.get_many::<String>("paths") else {
        eprintln!("usage: xmount [options] <input image(s)> <mount point>");
        std::process::exit(1);
    };
    let paths: Vec<&String> = paths.collect();
    if paths.len() < 2 {
        eprintln!("usage: xmount [options] <input image(s)> <mount point>");
        std::process::exit(1);
    }
    let mountpoint = paths[paths.len() - 1];
    let input_path = paths[0];

    let input_variant = match InputVariant::parse(matches.get_one::<String>("in").unwrap()) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    let output_format = match VirtualFormat::parse(matches.get_one::<String>("out").unwrap()) {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let (cache_path, overwrite_cache) = match (
        matches.get_one::<String>("cache"),
        matches.get_one::<String>("owcache"),
    ) {
        (_, Some(path)) => (Some(path.clone()), true),
        (Some(path), None) => (Some(path.clone()), false),
        (None, None) => (None, false),
    };

    let config = SessionConfig {
        input_path: input_path.clone(),
        input_variant,
        output_format,
        cache_path,
        overwrite_cache,
    };

    let xmount_fs = match session::build_filesystem(&config) {
        Ok(fs) => fs,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let raw_opts: Vec<String> = matches
        .get_many::<String>("mount-options")
        .map(|vs| vs.cloned().collect())
        .unwrap_or_default();
    let options = build_mount_options(&raw_opts);

    if matches.get_flag("single-threaded") {
        log::debug!("single-threaded serving requested; fuser dispatches requests from one session loop regardless");
    }

    if let Err(e) = fuser::mount2(xmount_fs, mountpoint, &options) {
        error!("mount failed: {e}");
        std::process::exit(1);
    }
}

/// Builds the `fuser` mount option set from `-o` values, honoring the
/// default-`allow_other`-unless-suppressed policy (§6 "Environment").
fn build_mount_options(raw_opts: &[String]) -> Vec<MountOption> {
    let mut options = vec![MountOption::FSName("xmount".to_string())];

    let values: Vec<String> = raw_opts.iter().flat_map(|o| o.split(',')).map(|s| s.to_string()).collect();

    if values.iter().any(|v| v == "no_allow_other") {
        return options;
    }

    if !values.is_empty() {
        for v in &values {
            options.push(MountOption::CUSTOM(v.clone()));
        }
        return options;
    }

    if allow_other_permitted() {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mirrors the reference's `CheckFuseAllowOther`: when not running as root,
/// `allow_other` is only safe to request if `/etc/fuse.conf` grants
/// `user_allow_other`.
fn allow_other_permitted() -> bool {
    if unsafe { libc::geteuid() } == 0 {
        return true;
    }

    match std::fs::read_to_string(Path::new("/etc/fuse.conf")) {
        Ok(contents) => {
            let allowed = contents.lines().map(str::trim).any(|l| l == "user_allow_other");
            if !allowed {
                warn!("allow_other requires 'user_allow_other' in /etc/fuse.conf; suppressing it");
            }
            allowed
        }
        Err(_) => {
            warn!("could not read /etc/fuse.conf; suppressing allow_other");
            false
        }
    }
}
