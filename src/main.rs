use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use tftp_upload::{ClientConfig, FileMode, LogObserver, TftpClient, UploadOutcome};

#[derive(FromArgs, Debug)]
#[argh(
    description = "Upload a file to a TFTP server",
    example = "Upload a firmware image:\n  {command_name} 192.168.1.20 ./firmware.bin --name fw.bin"
)]
struct Args {
    #[argh(positional, description = "server host name or IP address")]
    host: String,

    #[argh(positional, description = "local file to upload")]
    file: PathBuf,

    #[argh(option, short = 'n', description = "name on the server (defaults to the local file name)")]
    name: Option<String>,

    #[argh(option, short = 'p', default = "tftp_upload::config::DEFAULT_PORT", description = "server port")]
    port: u16,

    #[argh(
        option,
        short = 'm',
        default = "FileMode::Octet",
        from_str_fn(parse_mode),
        description = "transfer mode: octet, netascii or mail"
    )]
    mode: FileMode,

    #[argh(option, short = 't', default = "5", description = "seconds to wait for an acknowledgement")]
    timeout: u64,

    #[argh(option, short = 'r', default = "3", description = "retransmissions per packet before giving up")]
    retries: usize,
}

fn parse_mode(value: &str) -> Result<FileMode, String> {
    value.parse().map_err(|e| format!("{e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Args = argh::from_env();
    let name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("Cannot derive a remote name from the file path, pass --name")?,
    };

    let config = ClientConfig {
        port: args.port,
        timeout: Duration::from_secs(args.timeout),
        max_retries: args.retries,
        ..ClientConfig::new(args.host)
    };
    let client = TftpClient::new(config, Arc::new(LogObserver));

    let upload = client.send_file(&args.file, &name, args.mode);
    tokio::pin!(upload);
    let outcome = tokio::select! {
        outcome = &mut upload => outcome,
        _ = tokio::signal::ctrl_c() => {
            client.cancel();
            upload.await
        }
    };

    match outcome.with_context(|| format!("Failed to upload {}", args.file.display()))? {
        UploadOutcome::Completed => Ok(()),
        UploadOutcome::Cancelled => bail!("Upload interrupted"),
    }
}
