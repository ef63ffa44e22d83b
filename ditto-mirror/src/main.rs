use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context as _};
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ditto_common::{ByteRange, HashReader, ListObjectsV2Query, ObjectOptions, OpContext};
use ditto_mirror::{MirrorConfig, MirroringLayer};

const DEFAULT_CONFIG_PATH: &str = "ditto.toml";

const USAGE: &str = "usage: ditto-mirror <command> [args]

commands:
  mb <bucket>                 create a bucket on both backends
  rb <bucket>                 remove an empty bucket
  ls [bucket [prefix]]        list buckets, or objects in a bucket
  put <bucket> <key> <file>   upload a file
  get <bucket> <key> [file]   download an object (to stdout by default)
  stat <bucket> <key>         show object metadata
  rm <bucket> <key>           delete an object

The config file is read from $DITTO_CONFIG or ./ditto.toml.";

fn positional(args: &[String], i: usize) -> anyhow::Result<&str> {
    match args.get(i) {
        Some(value) => Ok(value),
        None => bail!("Missing argument for '{}'\n\n{USAGE}", args[0]),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let arg = |i: usize| positional(&args, i);

    let config_path = PathBuf::from(
        std::env::var("DITTO_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string()),
    );
    let config = MirrorConfig::load(&config_path)?;
    let layer = MirroringLayer::from_config(&config)?;
    let ctx = OpContext::background();
    let opts = ObjectOptions::default();

    match command {
        "mb" => {
            let bucket = arg(1)?;
            let outcome = layer.make_bucket_with_location(&ctx, bucket, "").await?;
            info!(bucket = %bucket, served_by = outcome.served_by.as_str(), "Bucket created");
        }
        "rb" => {
            let bucket = arg(1)?;
            let outcome = layer.delete_bucket(&ctx, bucket).await?;
            info!(bucket = %bucket, served_by = outcome.served_by.as_str(), "Bucket removed");
        }
        "ls" => match args.get(1) {
            None => {
                let outcome = layer.list_buckets(&ctx).await?;
                for bucket in &outcome.value {
                    println!("{}\t{}", bucket.created.to_rfc3339(), bucket.name);
                }
            }
            Some(bucket) => {
                let mut query = ListObjectsV2Query {
                    prefix: args.get(2).cloned().unwrap_or_default(),
                    ..Default::default()
                };
                loop {
                    let page = layer.list_objects_v2(&ctx, bucket, &query).await?.value;
                    for prefix in &page.prefixes {
                        println!("{:>12}\t{}", "PRE", prefix);
                    }
                    for object in &page.objects {
                        println!("{:>12}\t{}", object.size, object.name);
                    }
                    match page.next_continuation_token {
                        Some(token) if page.is_truncated => query.continuation_token = Some(token),
                        _ => break,
                    }
                }
            }
        },
        "put" => {
            let (bucket, key, path) = (arg(1)?, arg(2)?, PathBuf::from(arg(3)?));
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let size = file.metadata().await?.len();
            let data = HashReader::new(file, size, None)?;
            let outcome = layer
                .put_object(&ctx, bucket, key, data, HashMap::new(), &opts)
                .await?;
            info!(
                bucket = %bucket,
                key = %key,
                size = outcome.value.size,
                etag = %outcome.value.etag,
                served_by = outcome.served_by.as_str(),
                "Object stored"
            );
        }
        "get" => {
            let (bucket, key) = (arg(1)?, arg(2)?);
            let outcome = match args.get(3) {
                Some(path) => {
                    let mut file = tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("Failed to create {path}"))?;
                    let outcome = layer
                        .get_object(&ctx, bucket, key, ByteRange::full(), &mut file, None, &opts)
                        .await?;
                    file.sync_all().await?;
                    outcome
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let outcome = layer
                        .get_object(&ctx, bucket, key, ByteRange::full(), &mut stdout, None, &opts)
                        .await?;
                    stdout.flush().await?;
                    outcome
                }
            };
            info!(bucket = %bucket, key = %key, served_by = outcome.served_by.as_str(), "Object read");
        }
        "stat" => {
            let (bucket, key) = (arg(1)?, arg(2)?);
            let outcome = layer.get_object_info(&ctx, bucket, key, &opts).await?;
            let object = &outcome.value;
            println!("size:         {}", object.size);
            println!("etag:         {}", object.etag);
            println!("content-type: {}", object.content_type.as_deref().unwrap_or("-"));
            println!("modified:     {}", object.mod_time.to_rfc3339());
            println!("served-by:    {}", outcome.served_by.as_str());
        }
        "rm" => {
            let (bucket, key) = (arg(1)?, arg(2)?);
            let outcome = layer.delete_object(&ctx, bucket, key).await?;
            info!(bucket = %bucket, key = %key, served_by = outcome.served_by.as_str(), "Object deleted");
        }
        other => bail!("Unknown command: {other}\n\n{USAGE}"),
    }
    Ok(())
}
