use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bucketview::browser::paths::{DELIMITER, parent_prefix};
use bucketview::browser::{BrowserObject, UploadOptions, UploadSource, UploadStatus};
use bucketview::{Browser, BrowserConfig};
use bucketview_core::{ObjectEntry, S3Storage, StorageConfig};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    List {
        prefix: String,
        versions: bool,
        page: u32,
    },
    Upload {
        paths: Vec<PathBuf>,
        to: String,
        force: bool,
    },
    Remove {
        target: String,
        versions: bool,
    },
    MakeDir {
        name: String,
        parent: String,
    },
    Help,
}

fn parse_cli<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(Command::Help);
    };
    let mut positional = Vec::new();
    let mut versions = false;
    let mut force = false;
    let mut page = 1;
    let mut target_prefix = String::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--versions" => versions = true,
            "--force" => force = true,
            "--page" => {
                let value = args.next().context("--page needs a number")?;
                page = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid page: {value}"))?;
            }
            "--to" | "--in" => target_prefix = args.next().context("missing prefix")?,
            "--help" | "-h" => return Ok(Command::Help),
            flag if flag.starts_with("--") => anyhow::bail!("unknown argument: {flag}"),
            _ => positional.push(arg),
        }
    }

    match command.as_str() {
        "ls" => {
            if positional.len() > 1 {
                anyhow::bail!("ls takes at most one prefix");
            }
            Ok(Command::List {
                prefix: positional.pop().unwrap_or_default(),
                versions,
                page: page.max(1),
            })
        }
        "upload" => {
            if positional.is_empty() {
                anyhow::bail!("upload needs at least one path");
            }
            Ok(Command::Upload {
                paths: positional.into_iter().map(PathBuf::from).collect(),
                to: target_prefix,
                force,
            })
        }
        "rm" => match <[String; 1]>::try_from(positional) {
            Ok([target]) => Ok(Command::Remove { target, versions }),
            Err(_) => anyhow::bail!("rm takes exactly one key or prefix"),
        },
        "mkdir" => match <[String; 1]>::try_from(positional) {
            Ok([name]) => Ok(Command::MakeDir {
                name,
                parent: target_prefix,
            }),
            Err(_) => anyhow::bail!("mkdir takes exactly one name"),
        },
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn print_usage() {
    println!("Usage: bucketview <command> [options]");
    println!("  ls [prefix] [--versions] [--page N]   List a folder");
    println!("  upload <path>... [--to prefix] [--force]");
    println!("                                        Upload files or directories");
    println!("  rm <key | prefix/> [--versions]       Delete a key or a whole prefix");
    println!("  mkdir <name> [--in prefix]            Create an empty folder");
    println!();
    println!("Storage: BUCKETVIEW_BUCKET, BUCKETVIEW_ACCESS_KEY, BUCKETVIEW_SECRET_KEY,");
    println!("         BUCKETVIEW_ENDPOINT, BUCKETVIEW_REGION, BUCKETVIEW_FORCE_PATH_STYLE");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bucketview=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = parse_cli(std::env::args())?;
    if command == Command::Help {
        print_usage();
        return Ok(());
    }

    let storage = S3Storage::new(&StorageConfig::from_env()?)?;
    let browser = Browser::new(BrowserConfig::from_env());
    browser.init(Arc::new(storage));

    match command {
        Command::List {
            prefix,
            versions,
            page,
        } => list(&browser, &prefix, versions, page).await,
        Command::Upload { paths, to, force } => upload(&browser, paths, &to, force).await,
        Command::Remove { target, versions } => remove(&browser, &target, versions).await,
        Command::MakeDir { name, parent } => {
            browser.go_to(&parent).await?;
            let key = browser.create_folder(&name).await?;
            println!("created {key}");
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

async fn list(browser: &Browser, prefix: &str, versions: bool, page: u32) -> anyhow::Result<()> {
    if versions {
        browser.set_show_versions(true).await?;
    }
    browser.go_to(prefix).await?;
    browser.wait_for_count().await;
    for _ in 1..page {
        if !browser.snapshot().has_more {
            anyhow::bail!("{prefix} has fewer than {page} pages");
        }
        browser.next_page().await?;
    }

    for row in browser.displayed_objects() {
        println!("{}", format_row(&row)?);
    }
    let state = browser.snapshot();
    match state.total_objects {
        Some(total) => eprintln!("page {} of {total} entries", state.cursor.page),
        None => eprintln!("page {}", state.cursor.page),
    }
    Ok(())
}

fn format_row(row: &BrowserObject) -> anyhow::Result<String> {
    if row.is_folder() {
        return Ok(format!("{:>25} {:>12} {}{DELIMITER}", "", "PRE", row.key));
    }
    let modified = row.last_modified.format(&Rfc3339)?;
    let mut line = format!("{modified:>25} {:>12} {}", row.size, row.key);
    if let Some(version_id) = &row.version_id {
        line.push_str(&format!("  [{version_id}]"));
    }
    if row.is_delete_marker {
        line.push_str("  (delete marker)");
    }
    if let Some(history) = row.versions.as_ref().filter(|history| history.len() > 1) {
        line.push_str(&format!("  +{} older", history.len() - 1));
    }
    Ok(line)
}

async fn upload(browser: &Browser, paths: Vec<PathBuf>, to: &str, force: bool) -> anyhow::Result<()> {
    browser.go_to(to).await?;
    let options = UploadOptions {
        ignore_duplicates: force,
        ..UploadOptions::default()
    };
    for path in paths {
        let started = browser
            .upload(UploadSource::Local(path.clone()), options)
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        tracing::info!(files = started.len(), path = %path.display(), "upload queued");
    }
    browser.wait_for_uploads().await?;

    let uploads = browser.snapshot().uploading;
    for entry in &uploads {
        match &entry.failure {
            Some(reason) => println!("{:<12} {} ({reason})", "failed", entry.key),
            None => println!("{:<12} {}", format!("{:?}", entry.status).to_lowercase(), entry.key),
        }
    }
    let failed = uploads
        .iter()
        .filter(|entry| entry.status == UploadStatus::Failed)
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} upload(s) failed");
    }
    Ok(())
}

async fn remove(browser: &Browser, target: &str, versions: bool) -> anyhow::Result<()> {
    let parent = parent_prefix(target);
    if target.ends_with(DELIMITER) {
        let folder = BrowserObject::folder(&parent, target)
            .with_context(|| format!("{target} is not a folder"))?;
        browser.go_to(&parent).await?;
        browser.delete_folder(&folder, versions).await?;
        println!("deleted {target}");
        return Ok(());
    }
    if versions {
        anyhow::bail!("--versions applies to prefixes; pass {target}/ to purge a folder's history");
    }
    let entry = ObjectEntry {
        key: target.to_string(),
        size: 0,
        last_modified: OffsetDateTime::now_utc(),
        etag: None,
    };
    let object = BrowserObject::from_object(&parent, &entry)
        .with_context(|| format!("{target} is not a deletable key"))?;
    browser.delete_object(&object, false).await?;
    println!("deleted {target}");
    Ok(())
}
