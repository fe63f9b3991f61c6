use owo_colors::OwoColorize;
use tokio::task;

use crate::urls::ResolvedUrls;

#[derive(Debug, Clone, clap::Parser)]
#[clap(name = "devserve", about = "Start a local development server")]
pub struct Args {
    #[clap(default_value = "./", help = "Project directory to serve")]
    pub project_dir: String,
    #[clap(
        long = "no-open-browser",
        default_value_t = false,
        action = clap::ArgAction::SetTrue,
        help = "Disable automatically opening the default browser"
    )]
    pub no_open_browser: bool,
}

pub fn notice(message: &str) {
    println!("{}", message.cyan());
}

pub fn warn(message: &str) {
    println!("{}", message.yellow());
}

pub fn error(message: &str) {
    println!("{}", message.red());
}

/// Notice printed when the HOST environment variable overrides the default
/// bind address, so a stray shell export is easy to spot.
pub fn host_override_notice(host: &str) {
    println!(
        "{}",
        format!(
            "Attempting to bind to HOST environment variable: {}",
            host.bold().yellow()
        )
        .cyan()
    );
    println!("If this was unintentional, check that you haven't mistakenly set it in your shell.");
    println!();
}

#[derive(Debug, Clone)]
pub struct ReadyBanner {
    pub app_name: String,
    pub local_url: String,
    pub lan_url: Option<String>,
    pub build_command: String,
}

impl ReadyBanner {
    pub fn new(app_name: &str, urls: &ResolvedUrls, build_command: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            local_url: urls.local_url.clone(),
            lan_url: urls.lan_url.clone(),
            build_command: build_command.to_string(),
        }
    }
}

pub fn print_ready_banner(banner: &ReadyBanner) {
    println!(
        "You can now view {} in the browser.",
        banner.app_name.bold()
    );
    match &banner.lan_url {
        Some(lan_url) => {
            println!("  {}            {}", "Local:".bold(), banner.local_url);
            println!("  {}  {}", "On Your Network:".bold(), lan_url);
        }
        None => println!("  {}", banner.local_url),
    }
    println!();
    println!("Note that the development build is not optimized.");
    println!(
        "To create a production build, use {}.",
        banner.build_command.cyan()
    );
    println!();
}

pub fn clear_console() {
    if cfg!(windows) {
        print!("\x1b[2J\x1b[0f");
    } else {
        print!("\x1b[2J\x1b[3J\x1b[H");
    }
}

pub fn launch_browser(url: String) {
    task::spawn(async move {
        match task::spawn_blocking(move || open::that(url)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                eprintln!("[devserve] failed to open browser: {error}");
            }
            Err(error) => {
                eprintln!("[devserve] browser task join error: {error}");
            }
        }
    });
}
