use anytls::padding::PaddingCell;
use anytls::rate::IpTracker;
use anytls::redirect::{run_redirect, RedirectContext};
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

fn print_usage_and_exit(arg0: &str) -> ! {
    eprintln!(
        "Usage: {} -p <password> [-l <listen>] [-s <downstream host:port>]",
        arg0
    );
    std::process::exit(1);
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOG_LEVEL", "debug")).init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);

    let mut listen = "0.0.0.0:9443".to_string();
    let mut downstream = "127.0.0.1:8443".to_string();
    let mut password = String::new();

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
            "-s" => downstream = value(),
            "-p" => password = value(),
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

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("could not build tokio runtime");

    log::info!("[redirect] {}", concat!("anytls/", env!("CARGO_PKG_VERSION")));
    log::info!("[redirect] {} => {}", listen, downstream);

    runtime.block_on(async move {
        let ctx = Arc::new(RedirectContext::new(
            &password,
            downstream,
            Arc::new(PaddingCell::default()),
            IpTracker::new(),
        ));
        if let Err(e) = run_redirect(&listen, ctx, CancellationToken::new()).await {
            log::error!("listen redirect tcp: {}", e);
            std::process::exit(1);
        }
    });
}
