use std::{
    error::Error,
    mem::take,
    net::IpAddr,
    path::Path,
    sync::Arc,
};

use mailveil_engine::{
    load_config, Engine, Envelope, LogNotifier, MemoryDirectory, SmtpRelay,
    spam::SpamdClient,
};
use tokio::{
    io::{
        split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader, ReadHalf, WriteHalf,
    },
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, info};

const CONFIG_ENV: &str = "MAILVEIL_CONFIG";
const CONFIG_DEFAULT: &str = "mailveil.toml";

/// Represents a single SMTP session, created for each incoming connection.
///
/// Holds the envelope under construction: sender, ordered recipients and the
/// HELO domain, plus the client IP for SPF verification downstream.
#[derive(Debug, Default)]
struct SmtpSession {
    from: String,
    rcpts: Vec<String>,
    helo_domain: Option<String>,
    client_ip: Option<IpAddr>,
}

impl SmtpSession {
    pub fn new(client_ip: Option<IpAddr>) -> Self {
        Self {
            client_ip,
            ..Default::default()
        }
    }

    /// Base handler for the SMTP commands, should concentrate all the
    /// command handling in a single place for better maintainability.
    pub async fn handle_command<R: AsyncRead + AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        engine: &Engine,
        command: &str,
        arg: Option<&str>,
    ) -> Result<(), Box<dyn Error>> {
        match command {
            "EHLO" | "HELO" => {
                self.handle_ehlo_helo(writer, arg).await?;
            }
            "MAIL" => {
                if let Some(value) = arg {
                    self.handle_mail(writer, value).await?;
                }
            }
            "RCPT" => {
                if let Some(value) = arg {
                    self.handle_rcpt(writer, value).await?;
                }
            }
            "DATA" => {
                self.handle_data(reader, writer, engine).await?;
            }
            "RSET" => {
                self.handle_rset(writer).await?;
            }
            "NOOP" => {
                self.write_response(writer, 250, "OK").await;
            }
            "QUIT" => {
                self.handle_quit(writer).await?;
            }
            _ => {
                self.handle_unknown(writer).await?;
            }
        }
        Ok(())
    }

    async fn handle_ehlo_helo<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        arg: Option<&str>,
    ) -> Result<(), Box<dyn Error>> {
        self.helo_domain = arg.map(|d| d.to_string());
        self.write_multiple(writer, 250, &["mailveil greets you", "8BITMIME"])
            .await;
        Ok(())
    }

    async fn handle_mail<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        value: &str,
    ) -> Result<(), Box<dyn Error>> {
        if let Some(value) = value.strip_prefix("FROM:") {
            // the null sender <> is legitimate here: bounces arrive with it
            self.from = strip_angle_brackets(value).to_string();
            self.write_response(writer, 250, "OK").await;
        } else {
            self.write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
        }
        Ok(())
    }

    async fn handle_rcpt<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        value: &str,
    ) -> Result<(), Box<dyn Error>> {
        if let Some(value) = value.strip_prefix("TO:") {
            let rcpt = strip_angle_brackets(value).to_string();
            if !self.rcpts.contains(&rcpt) {
                self.rcpts.push(rcpt);
            }
            self.write_response(writer, 250, "OK").await;
        } else {
            self.write_response(writer, 501, "Syntax error in parameters or arguments")
                .await;
        }
        Ok(())
    }

    async fn handle_data<R: AsyncRead + AsyncBufRead + Unpin, W: AsyncWrite + Unpin>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        engine: &Engine,
    ) -> Result<(), Box<dyn Error>> {
        if self.rcpts.is_empty() {
            self.write_response(writer, 554, "No valid recipients")
                .await;
            return Ok(());
        }

        self.write_response(writer, 354, "End data with <CR><LF>.<CR><LF>")
            .await;

        let mut buffer = [0u8; 4096];
        let mut buffer_data = Vec::<u8>::new();
        let mut last_bytes = Vec::<u8>::with_capacity(5);

        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buffer[..n];
                    buffer_data.extend_from_slice(chunk);

                    // Add new bytes to sliding window, and then check if the last
                    // 5 bytes are the pre-agreed termination sequence
                    last_bytes.extend_from_slice(chunk);
                    if last_bytes.len() > 5 {
                        last_bytes.drain(0..last_bytes.len() - 5);
                    }
                    if last_bytes.ends_with(b"\r\n.\r\n") {
                        buffer_data.truncate(buffer_data.len() - 5);
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        let data = String::from_utf8_lossy(&buffer_data).into_owned();
        let from = take(&mut self.from);
        let rcpts = take(&mut self.rcpts);

        let mut envelope = Envelope::new(&from, rcpts, &data);
        envelope.client_ip = self.client_ip;
        envelope.helo_domain = self.helo_domain.clone();

        // the engine's status line is the protocol answer, verbatim
        let status = engine.handle(&envelope).await;
        self.write_response(writer, status.code, status.text).await;

        Ok(())
    }

    async fn handle_rset<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
    ) -> Result<(), Box<dyn Error>> {
        self.from.clear();
        self.rcpts.clear();
        self.write_response(writer, 250, "OK").await;
        Ok(())
    }

    async fn handle_quit<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), Box<dyn Error>> {
        self.write_response(writer, 221, "Bye").await;
        Ok(())
    }

    async fn handle_unknown<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), Box<dyn Error>> {
        self.write_response(writer, 502, "Command not implemented")
            .await;
        Ok(())
    }

    async fn read_command<R: AsyncRead + AsyncBufRead + Unpin>(
        &mut self,
        reader: &mut R,
        line: &mut String,
    ) -> (String, Option<String>) {
        line.clear();

        reader.read_line(line).await.unwrap_or(0);

        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("").trim_end().to_uppercase();
        let argument = parts.next().map(|arg| arg.trim_end().to_string());

        (command, argument)
    }

    async fn write_response<W: AsyncWrite + Unpin>(&self, writer: &mut W, code: u16, message: &str) {
        debug!(code, message, "response");
        writer
            .write_all(format!("{code} {message}\r\n").as_bytes())
            .await
            .ok();
    }

    async fn write_multiple<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        code: u16,
        messages: &[&str],
    ) {
        for (index, message) in messages.iter().enumerate() {
            let separator = if index == messages.len() - 1 { " " } else { "-" };
            debug!(code, message, "response");
            writer
                .write_all(format!("{code}{separator}{message}\r\n").as_bytes())
                .await
                .ok();
        }
    }
}

fn strip_angle_brackets(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
}

/// Main function for the SMTP ingress.
///
/// Listens for incoming connections on the configured port and handles each
/// of them on its own task; every accepted envelope goes through the shared
/// [`Engine`].
#[tokio::main(flavor = "multi_thread", worker_threads = 16)]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| CONFIG_DEFAULT.to_string());
    let config = load_config(Path::new(&config_path))?;

    let relay_address = config
        .engine
        .relay_address
        .clone()
        .unwrap_or_else(|| "127.0.0.1:25".to_string());
    let transport = Arc::new(SmtpRelay::new(&relay_address, &config.engine.domain));

    let mut engine = Engine::new(
        config.engine.clone(),
        Arc::new(MemoryDirectory::new()),
        transport,
        Arc::new(LogNotifier::new()),
    );
    if let Some(spamd) = &config.engine.spamd_address {
        engine = engine.with_scorer(Arc::new(SpamdClient::new(spamd)));
    }
    let engine = Arc::new(engine);

    let listening = format!("{}:{}", config.smtp.host, config.smtp.port);
    let listener = TcpListener::bind(&listening).await?;
    info!(address = %listening, domain = %config.engine.domain, "mailveil SMTP ingress running");

    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_smtp_session(stream, peer.ip(), engine).await {
                error!(peer = %peer, error = %e, "session failed");
            }
        });
    }
}

async fn handle_smtp_session(
    stream: TcpStream,
    client_ip: IpAddr,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn Error>> {
    // Optimize TCP settings, removing the delay and setting the TTL to 64
    stream.set_nodelay(true)?;
    stream.set_linger(None)?;
    stream.set_ttl(64)?;

    let mut session = SmtpSession::new(Some(client_ip));
    let (reader, writer) = split(stream);
    handle_stream(reader, writer, &engine, &mut session).await?;
    Ok(())
}

async fn handle_stream(
    reader: ReadHalf<TcpStream>,
    mut writer: WriteHalf<TcpStream>,
    engine: &Engine,
    session: &mut SmtpSession,
) -> Result<(), Box<dyn Error>> {
    let mut line = String::with_capacity(4096);
    let mut reader = BufReader::new(reader);

    session
        .write_response(&mut writer, 220, "mailveil SMTP")
        .await;

    loop {
        let (command, argument) = session.read_command(&mut reader, &mut line).await;
        if line.is_empty() {
            break;
        }

        debug!(line = %line.trim(), "command");

        let quit = command == "QUIT";
        session
            .handle_command(&mut reader, &mut writer, engine, &command, argument.as_deref())
            .await?;
        if quit {
            break;
        }
    }
    Ok(())
}
