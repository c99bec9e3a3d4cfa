//! Scripted BorIP control server for client-side testing.
//!
//! [`MockBoripServer`] listens on a random localhost port, accepts a single
//! client, sends a greeting line, and then walks a script of expected
//! request lines and canned replies. It lets client code be exercised
//! against exact protocol text, including replies a real server would never
//! produce.
//!
//! # Example
//!
//! ```
//! use borip_test_harness::MockBoripServer;
//!
//! # async fn example() -> borip_core::Result<()> {
//! let mut server = MockBoripServer::new().await?;
//! server.expect("DEVICE rtl", "DEVICE rtl-sdr|0.000000|49.600000|0.100000|2048000.000000|4096|Receive|0001");
//! server.expect("GO", "GO OK");
//! let addr = server.addr().to_string();
//! server.start();
//! // ... connect a client to `addr` ...
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use borip_core::error::{Error, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One scripted step.
#[derive(Debug, Clone)]
struct Exchange {
    /// The exact line (without terminator) the client must send.
    request: String,
    /// Reply line, or `None` to stay silent.
    response: Option<String>,
}

/// What the server does once the script is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterScript {
    /// Keep the connection open until the client closes it, ignoring
    /// anything it sends.
    #[default]
    Linger,
    /// Close the connection immediately.
    Close,
}

/// A mock BorIP control server.
pub struct MockBoripServer {
    addr: String,
    listener: Option<TcpListener>,
    greeting: String,
    script: VecDeque<Exchange>,
    after: AfterScript,
    handle: Option<JoinHandle<std::result::Result<Vec<String>, String>>>,
}

impl MockBoripServer {
    /// Bind a server on a random localhost port. It greets with `DEVICE -`
    /// until told otherwise.
    pub async fn new() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::Transport(format!("failed to bind mock BorIP server: {}", e)))?;
        let addr = listener.local_addr().map_err(Error::Io)?.to_string();
        Ok(Self {
            addr,
            listener: Some(listener),
            greeting: "DEVICE -".to_string(),
            script: VecDeque::new(),
            after: AfterScript::default(),
            handle: None,
        })
    }

    /// The first line sent to the client, e.g. `BUSY`.
    pub fn greeting(&mut self, line: &str) {
        self.greeting = line.to_string();
    }

    /// Expect `request` next and reply with `response`.
    pub fn expect(&mut self, request: &str, response: &str) {
        self.script.push_back(Exchange {
            request: request.to_string(),
            response: Some(response.to_string()),
        });
    }

    /// Expect `request` next and never answer it.
    pub fn expect_silence(&mut self, request: &str) {
        self.script.push_back(Exchange {
            request: request.to_string(),
            response: None,
        });
    }

    pub fn after_script(&mut self, after: AfterScript) {
        self.after = after;
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Accept one client in the background and run the script.
    pub fn start(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let greeting = self.greeting.clone();
        let script: Vec<Exchange> = self.script.drain(..).collect();
        let after = self.after;

        self.handle = Some(tokio::spawn(async move {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed to accept connection: {}", e))?;
            drop(listener);

            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut received = Vec::new();

            write_half
                .write_all(format!("{}\n", greeting).as_bytes())
                .await
                .map_err(|e| format!("greeting write error: {}", e))?;

            for (i, exchange) in script.iter().enumerate() {
                let mut line = String::new();
                let n = reader
                    .read_line(&mut line)
                    .await
                    .map_err(|e| format!("exchange {}: read error: {}", i, e))?;
                if n == 0 {
                    return Err(format!(
                        "exchange {}: client disconnected (expected {:?})",
                        i, exchange.request
                    ));
                }
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if line != exchange.request {
                    return Err(format!(
                        "exchange {}: request mismatch: expected {:?}, got {:?}",
                        i, exchange.request, line
                    ));
                }
                received.push(line);

                if let Some(response) = &exchange.response {
                    write_half
                        .write_all(format!("{}\n", response).as_bytes())
                        .await
                        .map_err(|e| format!("exchange {}: write error: {}", i, e))?;
                }
            }

            if after == AfterScript::Linger {
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => received.push(line.trim_end_matches(['\r', '\n']).to_string()),
                    }
                }
            }

            Ok(received)
        }));
    }

    /// Wait for the script to finish and return every line the client sent.
    ///
    /// In [`AfterScript::Linger`] mode this waits for the client to hang up.
    pub async fn wait(self) -> std::result::Result<Vec<String>, String> {
        match self.handle {
            Some(handle) => handle
                .await
                .map_err(|e| format!("server task panicked: {}", e))?,
            None => Ok(Vec::new()),
        }
    }
}
