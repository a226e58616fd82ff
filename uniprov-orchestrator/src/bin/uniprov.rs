use anyhow::{bail, Context as _};
use futures_util::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uniprov_common::{Context, Image, Instance};
use uniprov_orchestrator::{ImageLifecycle, InstanceLifecycle, Listing, ProviderManager, Settings};
use uniprov_providers::InstanceLogs;

const USAGE: &str = "usage:
  uniprov image build [package]
  uniprov image publish [package]
  uniprov image list
  uniprov image delete <name>
  uniprov image resize <name> <size>
  uniprov instance create [name]
  uniprov instance start|stop|delete <name>
  uniprov instance logs [--watch] <name>
  uniprov instance list";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    if args.is_empty() || matches!(args[0], "-h" | "--help" | "help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let settings = Settings::from_env()?;
    let mut ctx = settings.context();
    let provider = ProviderManager::connect(&settings.backend)
        .await
        .with_context(|| format!("backend '{}'", settings.backend))?;

    match args.as_slice() {
        ["image", rest @ ..] => {
            let builder = Arc::new(settings.builder());
            let mut images = ImageLifecycle::new(provider, builder).with_deadline(settings.timeout);
            match rest {
                ["build"] => println!("{}", images.build(&ctx).await?.display()),
                ["build", package] => {
                    let artifact = images.build_with_package(&ctx, Path::new(package)).await?;
                    println!("{}", artifact.display());
                }
                ["publish"] => print_image(&images.build_and_publish(&ctx, None).await?),
                ["publish", package] => {
                    let image = images
                        .build_and_publish(&ctx, Some(Path::new(package)))
                        .await?;
                    print_image(&image);
                }
                ["list"] => print_listing(images.list(&ctx).await?, print_image),
                ["delete", name] => images.delete(&ctx, name).await?,
                ["resize", name, size] => images.resize(&ctx, name, size).await?,
                _ => bail!("unknown image command\n{}", USAGE),
            }
        }
        ["instance", rest @ ..] => {
            let mut instances = InstanceLifecycle::new(provider).with_deadline(settings.timeout);
            match rest {
                ["create"] => print_instance(&instances.create(&ctx).await?),
                ["create", name] => {
                    ctx.run_config.instance_name = name.to_string();
                    print_instance(&instances.create(&ctx).await?);
                }
                ["start", name] => instances.start(&ctx, name).await?,
                ["stop", name] => instances.stop(&ctx, name).await?,
                ["delete", name] => instances.delete(&ctx, name).await?,
                ["logs", name] => follow_logs(&instances, &ctx, name, false).await?,
                ["logs", "--watch", name] | ["logs", name, "--watch"] => {
                    follow_logs(&instances, &ctx, name, true).await?
                }
                ["list"] => print_listing(instances.list(&ctx).await?, print_instance),
                _ => bail!("unknown instance command\n{}", USAGE),
            }
        }
        _ => bail!("unknown command\n{}", USAGE),
    }
    Ok(())
}

async fn follow_logs(
    instances: &InstanceLifecycle,
    ctx: &Context,
    name: &str,
    watch: bool,
) -> anyhow::Result<()> {
    match instances.logs(ctx, name, watch).await? {
        InstanceLogs::Snapshot(text) => print!("{}", text),
        InstanceLogs::Follow(mut tail) => {
            let token = tail.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });

            let mut stdout = std::io::stdout();
            while let Some(chunk) = tail.next().await {
                match chunk {
                    Ok(text) => {
                        stdout.write_all(text.as_bytes())?;
                        stdout.flush()?;
                    }
                    Err(e) if e.is_retryable() => tracing::warn!("⚠️ [logs] {}", e),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}

fn print_listing<T>(listing: Listing<T>, print: fn(&T)) {
    if let Some(warning) = &listing.warning {
        eprintln!("warning: {}", warning);
    }
    for item in &listing.items {
        print(item);
    }
}

fn print_image(image: &Image) {
    println!(
        "{}\t{}\t{}\t{}\t{}",
        image.name,
        image.status,
        image.id,
        image
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into()),
        image
            .size_bytes
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".into()),
    );
}

fn print_instance(instance: &Instance) {
    println!(
        "{}\t{}\t{}\t{}\t{}",
        instance.name,
        instance.status,
        instance.id,
        instance.image_id.as_deref().unwrap_or("-"),
        if instance.ip_addresses.is_empty() {
            "-".to_string()
        } else {
            instance.ip_addresses.join(",")
        },
    );
}
