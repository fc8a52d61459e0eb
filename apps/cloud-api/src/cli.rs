use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "cloud-api", version, about = "Gateway/device cloud API")]
pub struct Args {
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
}
