use clap::Parser;
use std::path::PathBuf;

use camlink_core::config::{self, EndpointAddress};
use camlink_core::webrtc::SessionError;

#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(version)]
#[command(about = "Streams a local camera to a remote viewer over WebRTC", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/camlink.toml")]
    pub config: PathBuf,

    /// Signaling endpoint for this run (overrides the stored address)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Store a new signaling endpoint and exit
    #[arg(long, value_name = "URL")]
    pub set_url: Option<String>,

    /// UDP address for RTP ingest
    #[arg(long)]
    pub rtp_listen: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, SessionError> {
        let mut config = config::Config::load(&self.config)?;
        if let Some(ref listen) = self.rtp_listen {
            config.capture.rtp_listen = listen.clone();
        }
        Ok(config)
    }

    pub fn url_override(&self) -> Result<Option<EndpointAddress>, SessionError> {
        self.url.as_deref().map(EndpointAddress::parse).transpose()
    }
}
