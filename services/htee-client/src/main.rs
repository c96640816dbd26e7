// htee: tee stdin to a stream server and to stdout.
//
// Bytes are echoed to the terminal only after the server has accepted the
// upload with its interim 100 Continue, so a rejected request never looks
// like it went through.

use clap::{Arg, Command};
use htee_client::{Client, ClientError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let matches = Command::new("htee")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pipe stdin to an htee server while echoing it to stdout")
        .arg(
            Arg::new("path")
                .help("Stream path, e.g. /builds/today")
                .required(true),
        )
        .arg(
            Arg::new("endpoint")
                .help("Server endpoint")
                .short('e')
                .long("endpoint")
                .env("HTEE_ENDPOINT")
                .default_value("http://127.0.0.1:4000"),
        )
        .arg(
            Arg::new("token")
                .help("Authorization token")
                .short('t')
                .long("token")
                .env("HTEE_TOKEN"),
        )
        .get_matches();

    let path = matches.get_one::<String>("path").expect("path is required");
    let endpoint = matches
        .get_one::<String>("endpoint")
        .expect("endpoint has a default");
    let token = matches.get_one::<String>("token").cloned();

    if let Err(code) = tee(endpoint, token, path).await {
        std::process::exit(code);
    }
}

async fn tee(endpoint: &str, token: Option<String>, path: &str) -> Result<(), i32> {
    let client = Client::new(endpoint, token).map_err(|e| {
        eprintln!("htee: {}", e);
        1
    })?;

    let mut upload = match client.post(path).await {
        Ok(upload) => upload,
        Err(ClientError::Rejected(head)) => {
            eprintln!("htee: server rejected upload: {}", head.status_line());
            return Err(1);
        }
        Err(e) => {
            eprintln!("htee: {}", e);
            return Err(1);
        }
    };

    // Tell the user where readers can attach.
    if let Some(location) = upload.location() {
        match client.url_for(location) {
            Ok(url) => eprintln!("{}", url),
            Err(_) => eprintln!("{}", location),
        }
    }

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                eprintln!("htee: reading stdin: {}", e);
                return Err(1);
            }
        };
        if let Err(e) = upload.send(&buf[..n]).await {
            eprintln!("htee: {}", e);
            return Err(1);
        }
        if stdout.write_all(&buf[..n]).await.is_err() {
            return Err(1);
        }
        let _ = stdout.flush().await;
    }

    match upload.finish().await {
        Ok(head) if head.status == 204 => Ok(()),
        Ok(head) => {
            eprintln!("htee: unexpected final response: {}", head.status_line());
            Err(2)
        }
        Err(e) => {
            eprintln!("htee: {}", e);
            Err(1)
        }
    }
}
