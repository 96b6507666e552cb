// Copyright (c) 2019 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{Dispatch, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use strata::registry::DEFAULT_JOBS;
use strata::{parse_annotations, BuildOptions, Builder, Compression, PathSpec};

/// Publish simple container images in a few seconds, no daemon required.
#[derive(Debug, Parser)]
#[command(name = "strata", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build an image from local paths and push it
    Build(BuildArgs),
    /// Print the version
    Version,
}

#[derive(Debug, Args)]
struct BuildArgs {
    /// Base image, empty or "scratch" for none
    #[arg(short, long, default_value = "")]
    base: String,

    /// Image to push
    #[arg(short, long)]
    target: String,

    /// Pull the base image over plain HTTP
    #[arg(long, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set, default_value_t = false)]
    pull_insecure: bool,

    /// Push the target image over plain HTTP
    #[arg(long, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set, default_value_t = false)]
    push_insecure: bool,

    /// Directory holding the config.json used to pull
    #[arg(long)]
    pull_config_dir: Option<PathBuf>,

    /// Directory holding the config.json used to push
    #[arg(long)]
    push_config_dir: Option<PathBuf>,

    /// key=value annotations for the last layer
    #[arg(short, long, value_delimiter = ',')]
    annotations: Vec<String>,

    /// Package directories with their whole subtree
    #[arg(short, long)]
    recursive: bool,

    /// Do not print build progress
    #[arg(short, long)]
    quiet: bool,

    /// Clear the image entrypoint
    #[arg(long)]
    clear_entrypoint: bool,

    /// User to run the container as
    #[arg(long, default_value = "")]
    run_as: String,

    /// Blob transfers to run at once
    #[arg(short, long, default_value_t = DEFAULT_JOBS)]
    jobs: usize,

    /// Layer compression: gzip, zstd or disabled
    #[arg(long, default_value_t = Compression::Gzip)]
    compression: Compression,

    /// local:remote path specs
    #[arg(required = true, value_name = "LOCAL:REMOTE")]
    paths: Vec<String>,
}

fn log_dispatch(quiet: bool) -> Dispatch {
    if quiet {
        return Dispatch::none();
    }
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr.with_max_level(Level::WARN).or_else(std::io::stdout))
        .finish();
    Dispatch::new(subscriber)
}

async fn run_build(args: BuildArgs) -> Result<()> {
    let specs = args
        .paths
        .iter()
        .map(|p| p.parse())
        .collect::<Result<Vec<PathSpec>, _>>()?;
    let annotations = parse_annotations(&args.annotations)?;

    let options = BuildOptions {
        base: args.base,
        target: args.target,
        pull_insecure: args.pull_insecure,
        push_insecure: args.push_insecure,
        pull_config_dir: args.pull_config_dir,
        push_config_dir: args.push_config_dir,
        annotations,
        recursive: args.recursive,
        clear_entrypoint: args.clear_entrypoint,
        run_as: args.run_as,
        jobs: args.jobs,
        compression: args.compression,
        temp_dir: None,
        output: log_dispatch(args.quiet),
    };

    let digest = Builder::remote(options.jobs).build(&options, &specs).await?;
    println!("{}", digest);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Build(args) => run_build(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
