use anytls::padding::PaddingCell;
use anytls::rate::IpTracker;
use anytls::server::{run_server, ServerContext};
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

fn print_usage_and_exit(arg0: &str) -> ! {
    eprintln!(
        "Usage: {} -p <password> [-l <host:port>] [-padding-scheme <file>]",
        arg0
    );
    std::process::exit(1);
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOG_LEVEL", "debug")).init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);

    let mut listen = "0.0.0.0:8443".to_string();
    let mut password = String::new();
    let mut padding_scheme_file: Option<String> = None;

    while !args.is_empty() {
        let flag = args.remove(0);
        let mut value = || {
            if args.is_empty() {
                eprintln!("Missing value for {}", flag);
                print_usage_and_exit(&arg0);
            }
            args.remove(0)
        };
        match flag.as_str() {
            "-l" => listen = value(),
            "-p" => password = value(),
            "-padding-scheme" => padding_scheme_file = Some(value()),
            _ => {
                eprintln!("Invalid argument: {}", flag);
                print_usage_and_exit(&arg0);
            }
        }
    }

    if password.is_empty() {
        eprintln!("please set password");
        std::process::exit(1);
    }

    let padding = Arc::new(PaddingCell::default());
    if let Some(path) = padding_scheme_file {
        match std::fs::read(&path) {
            Ok(raw) => {
                if padding.update_from_raw(&raw) {
                    log::info!("loaded padding scheme file: {}", path);
                } else {
                    log::error!("wrong format padding scheme file: {}", path);
                }
            }
            Err(e) => {
                eprintln!("failed to read padding scheme file {}: {}", path, e);
                std::process::exit(1);
            }
        }
    }

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("could not build tokio runtime");

    log::info!("[server] {}", concat!("anytls/", env!("CARGO_PKG_VERSION")));

    runtime.block_on(async move {
        let ctx = Arc::new(ServerContext::new(
            &password,
            padding,
            IpTracker::new(),
        ));
        if let Err(e) = run_server(&listen, ctx, CancellationToken::new()).await {
            log::error!("listen server tcp: {}", e);
            std::process::exit(1);
        }
    });
}
