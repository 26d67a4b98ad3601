use clap::Parser;
use std::net::IpAddr;
use std::net::SocketAddr;

#[derive(Parser)]
pub struct Opts {
    /// The port to listen on.
    #[clap(long, default_value = "7339")]
    pub port: u16,

    /// The address to bind to; defaults to all interfaces.
    #[clap(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// If enabled logs will be in json format
    #[clap(short, long)]
    pub json: bool,
}

impl Opts {
    // use this method to parse the options from the cli.
    pub fn read() -> Opts {
        Opts::parse()
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}
