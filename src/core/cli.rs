use clap::{Parser, command};

/// Bootstraps IIS Hostable Web Core for an ASP.NET application
#[derive(Parser, Debug, Default)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Physical path of the application served at the site root [default: current directory]
    #[arg(long = "appRootPath", value_name = "PATH")]
    pub app_root_path: Option<String>,

    /// Port the site binds to [default: $PORT or 8080]
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    /// Run the web core as this user, either `DOMAIN\user` or `user`
    #[arg(long)]
    pub user: Option<String>,

    /// Password of `--user`
    #[arg(long)]
    pub password: Option<String>,

    /// Optional YAML file with default settings
    #[arg(long = "configurationPath", value_name = "PATH")]
    pub configuration_path: Option<String>,
}
