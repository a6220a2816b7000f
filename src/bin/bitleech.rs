//! The `bitleech` command line client: reads a `.torrent` file, downloads it
//! into a directory, and exits once every piece has been verified and
//! written to disk.

use std::{path::PathBuf, process};

use bitleech::{conf::Conf, engine, metainfo::Metainfo};

struct Args {
    torrent_path: PathBuf,
    download_dir: PathBuf,
    verbose: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut verbose = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-v" | "--verbose" => verbose = true,
            _ => positional.push(arg),
        }
    }

    if positional.len() != 2 {
        return Err(format!(
            "expected 2 arguments, got {}\n\nusage: bitleech [-v] <torrent-file> <download-dir>",
            positional.len()
        ));
    }

    Ok(Args {
        torrent_path: PathBuf::from(&positional[0]),
        download_dir: PathBuf::from(&positional[1]),
        verbose,
    })
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}", msg);
            process::exit(2);
        }
    };

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    let raw = match std::fs::read(&args.torrent_path) {
        Ok(raw) => raw,
        Err(e) => {
            log::error!("failed to read {:?}: {}", args.torrent_path, e);
            process::exit(1);
        }
    };

    let metainfo = match Metainfo::from_bytes(&raw) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            log::error!("failed to parse {:?}: {}", args.torrent_path, e);
            process::exit(1);
        }
    };

    let conf = Conf::new(args.download_dir);

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            log::warn!("failed to listen for ctrl-c, shutdown signal disabled");
            // if we can't listen for the signal, just block forever rather
            // than immediately tripping the shutdown path
            std::future::pending::<()>().await;
        }
    };

    match engine::run(conf, metainfo, shutdown).await {
        Ok(()) => {
            log::info!("download finished");
        }
        Err(e) => {
            log::error!("download failed: {}", e);
            process::exit(1);
        }
    }
}
