//! entrypoint for waylay-cli

use std::{sync::Arc, time::Duration};

use clap::Parser;
use waylay_core::{BoxError, MitmConfig, Proxy, ProxyAuth, Shutdown};

mod ca;
mod cli;
mod error;
mod trace;

use cli::Cli;
use error::ErrorWithExitCode;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    trace::init_tracing(tracing::level_filters::LevelFilter::INFO);

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(err) = err.downcast_ref::<ErrorWithExitCode>() {
                eprintln!("exit with error ({}): {err}", err.exit_code());
                std::process::exit(err.exit_code());
            }
            eprintln!("exit with error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let mut builder = Proxy::builder()
        .timeout(if cli.timeout == 0 {
            Duration::from_secs(3600)
        } else {
            Duration::from_secs(cli.timeout)
        })
        .max_connections(cli.concurrent);

    if let Some(uri) = cli.downstream_proxy {
        builder = builder.downstream_proxy(uri);
    }

    if !cli.proxy_auth.is_empty() {
        let mut auth = ProxyAuth::new();
        for pair in &cli.proxy_auth {
            let (user, pass) = pair.split_once(':').ok_or_else(|| {
                ErrorWithExitCode::new(2, format!("--proxy-auth value {pair:?} is not user:password"))
            })?;
            auth = auth.with_credential(user, pass);
        }
        builder = builder.proxy_auth(auth);
    }

    if cli.mitm {
        let demo_ca = ca::DemoCertificateAuthority::generate().map_err(|err| ErrorWithExitCode::new(2, err))?;
        tracing::info!(
            root_cert_len = demo_ca.root_certificate_der().len(),
            "generated development MITM certificate authority; clients must trust it to avoid TLS errors"
        );
        builder = builder.mitm(MitmConfig::new(Arc::new(demo_ca)));
    }

    let proxy = Arc::new(builder.build());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .map_err(|err| ErrorWithExitCode::new(1, err))?;
    let local_addr = listener.local_addr().map_err(|err| ErrorWithExitCode::new(1, err))?;

    let graceful = Shutdown::default();
    graceful.spawn_task_fn(move |guard| async move {
        tracing::info!(bind = %local_addr, mitm = proxy.mitm.is_some(), "waylay listening");
        waylay_core::serve(proxy, guard, listener).await;
    });

    graceful
        .shutdown_with_limit(Duration::from_secs(30))
        .await
        .map_err(|err| ErrorWithExitCode::new(1, err))?;

    Ok(())
}
