//! Command-line surface (§10.3). A single-purpose binary, so unlike the
//! framework's multi-command front-end this is one flat [`clap::Parser`]
//! rather than a [`clap::Subcommand`] tree.

use std::net::SocketAddr;

use clap::Parser;
use http::Uri;

#[derive(Debug, Parser)]
#[command(name = "waylay")]
#[command(bin_name = "waylay")]
#[command(version, about = "intercepting HTTP/HTTPS forward proxy", long_about = None)]
pub struct Cli {
    /// address to accept connections on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// per-request timeout in seconds (0 = no timeout)
    #[arg(long, short = 't', default_value_t = 300)]
    pub timeout: u64,

    /// number of concurrent connections to allow (0 = unbounded)
    #[arg(long, short = 'c', default_value_t = 0)]
    pub concurrent: usize,

    /// terminate CONNECT tunnels and re-enter the request pipeline over TLS,
    /// using a development-only, freshly generated certificate authority
    #[arg(long)]
    pub mitm: bool,

    /// forward requests (and CONNECT) through a further upstream proxy
    #[arg(long)]
    pub downstream_proxy: Option<Uri>,

    /// require `Proxy-Authorization: Basic` with this `user:password` pair;
    /// repeatable
    #[arg(long = "proxy-auth", value_name = "USER:PASSWORD")]
    pub proxy_auth: Vec<String>,
}
