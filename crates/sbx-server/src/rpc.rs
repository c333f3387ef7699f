//! RPC surface: newline-delimited JSON over a persistent TCP connection.
//!
//! One `Request` per line in, one `Response` line back out; a connection
//! serves any number of requests. This is the hot path for command and file
//! operations, sharing the exact same services as the HTTP surface.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use sbx_core::CommandOverrides;
use sbx_proto::{validate_request, CommandResult, DirEntry, Request, Response};

use crate::state::AppState;

pub struct RpcServer {
    listener: TcpListener,
    state: AppState,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr, state: AppState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "RPC listening");
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> std::io::Result<()> {
        let mut incoming = TcpListenerStream::new(self.listener);
        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(socket) => {
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, state).await {
                            debug!("client connection ended: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("error accepting RPC connection: {}", e);
                }
            }
        }
        Ok(())
    }
}

async fn handle_client(socket: TcpStream, state: AppState) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&line, &state).await;
        let mut payload = serde_json::to_string(&response)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Decode, validate, and execute one request line.
pub(crate) async fn dispatch(line: &str, state: &AppState) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return Response::error("InvalidArgument", format!("malformed request: {}", e)),
    };
    if let Err(e) = validate_request(&request) {
        return Response::error("InvalidArgument", e.to_string());
    }

    match request {
        Request::Ping => Response::Pong,
        Request::RunCommand(req) => {
            let overrides = CommandOverrides {
                time_ms: req.time_ms,
                mem_kb: req.mem_kb,
                fsize_kb: req.fsize_kb,
                nofile: req.nofile,
                env: req.env,
                cwd: req.cwd,
            };
            match state.exec.run(&req.session_id, req.command, overrides).await {
                Ok(outcome) => Response::Command(CommandResult {
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    exit_code: outcome.exit_code,
                    signal: outcome.signal,
                    duration_ms: outcome.duration_ms,
                }),
                Err(e) => error_response(e),
            }
        }
        Request::WriteFile(req) => {
            let bytes = match req.decode_content() {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Response::error(
                        "InvalidArgument",
                        format!("content is not valid base64: {}", e),
                    );
                }
            };
            match state.files.write_file(&req.session_id, &req.path, bytes).await {
                Ok(()) => Response::FileWritten,
                Err(e) => error_response(e),
            }
        }
        Request::ReadFile(req) => {
            match state.files.read_file(&req.session_id, &req.path).await {
                Ok(bytes) => Response::file_content(&bytes),
                Err(e) => error_response(e),
            }
        }
        Request::ListDir(req) => {
            match state.files.list_dir(&req.session_id, &req.path).await {
                Ok(entries) => Response::DirListing {
                    entries: entries
                        .into_iter()
                        .map(|e| DirEntry {
                            name: e.name,
                            kind: e.kind.as_str().to_string(),
                            size: e.size,
                            modified_at: e.modified_at,
                        })
                        .collect(),
                },
                Err(e) => error_response(e),
            }
        }
        Request::SetEnv(req) => match state.registry.get(&req.session_id).await {
            Ok(session) => match session.set_env(req.env).await {
                Ok(()) => Response::EnvSet,
                Err(e) => error_response(e),
            },
            Err(e) => error_response(e),
        },
        Request::SetCwd(req) => match state.registry.get(&req.session_id).await {
            Ok(session) => match session.set_cwd(&req.cwd).await {
                Ok(()) => Response::CwdSet,
                Err(e) => error_response(e),
            },
            Err(e) => error_response(e),
        },
    }
}

/// Map a service error onto the wire, hiding internal details.
fn error_response(e: sbx_core::Error) -> Response {
    if e.is_user_error() {
        Response::error(e.kind(), e.to_string())
    } else {
        error!("internal error: {}", e);
        Response::error(e.kind(), "internal error")
    }
}
