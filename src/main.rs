use clap::Parser;
use devserve::compiler::{self, CompilerHandle, Mode};
use devserve::context::StartupContext;
use devserve::paths::ProjectPaths;
use devserve::server::{DevServer, ServerConfig};
use devserve::urls::ResolvedUrls;
use devserve::{cli, port, preflight, proxy};

enum Outcome {
    Shutdown,
    /// Port negotiation declined: stop silently, this is not an error.
    Aborted,
}

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();

    match run(args).await {
        Ok(Outcome::Shutdown | Outcome::Aborted) => {}
        Err(error) => {
            let message = error.to_string();
            if !message.is_empty() {
                cli::error(&message);
            }
            std::process::exit(1);
        }
    }
}

async fn run(args: cli::Args) -> anyhow::Result<Outcome> {
    let paths = ProjectPaths::resolve(&args.project_dir)?;
    let ctx = StartupContext::resolve(&paths)?;

    if ctx.host_overridden {
        cli::host_override_notice(&ctx.host);
    }

    if !preflight::check_required_files(&[&paths.app_html, &paths.app_entry]) {
        std::process::exit(1);
    }

    preflight::check_browser_targets(&paths, ctx.interactive).await?;

    let Some(negotiated) = port::negotiate(&ctx.host, ctx.desired_port, ctx.interactive).await?
    else {
        return Ok(Outcome::Aborted);
    };

    let build = compiler::build_config(
        Mode::Development,
        &paths,
        ctx.fast_refresh,
        &ctx.public_url_prefix,
    );
    let urls = ResolvedUrls::resolve(
        ctx.protocol,
        &ctx.host,
        negotiated.port,
        &ctx.public_url_prefix,
    );
    let compiler = CompilerHandle::create(
        &ctx.package.name,
        build,
        &urls,
        ctx.package_manager,
        ctx.uses_typescript,
    )?;
    let proxy = proxy::prepare(ctx.package.proxy.as_deref())?;

    let config = ServerConfig::assemble(&ctx, &paths, negotiated.port, proxy);
    let server = DevServer::new(config, compiler, negotiated.listener);
    server.run(&ctx, &urls, !args.no_open_browser).await?;

    Ok(Outcome::Shutdown)
}
