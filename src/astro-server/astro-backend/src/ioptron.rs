// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! iOptron mount over a serial line.
//!
//! The mount speaks `:`-prefixed, `#`-terminated ASCII. Replies arrive in
//! arbitrary chunks; this backend only moves bytes and the engine
//! assembles and parses frames.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;

use tracing::debug;

use astro_core::backend::{Backend, BackendError, BackendFuture, BackendId, BackendKind, Handle, Received};
use astro_core::device::controller::classify::ioptron as code;

pub type LineFuture<'a, T> = Pin<Box<dyn Future<Output = io::Result<T>> + Send + 'a>>;

/// One open byte line to a mount.
pub trait LineTransport: Send {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> LineFuture<'a, ()>;

    /// Bytes that arrived within a short poll window; empty when none did.
    fn read_available<'a>(&'a mut self) -> LineFuture<'a, Vec<u8>>;

    /// Drop unread input so a late reply never answers the next command.
    fn clear_input(&mut self);
}

/// Finds and opens lines by path.
pub trait PortConnector: Send {
    fn present(&self, path: &str) -> bool;

    fn connect(&mut self, path: &str) -> io::Result<Box<dyn LineTransport>>;
}

/// Map an I/O failure to a mount result code.
pub fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => code::DEVICE_REMOVED,
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => code::INVALID_PORT,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => code::TIMEOUT,
        io::ErrorKind::InvalidInput => code::INVALID_ARGUMENT,
        _ => code::IO_ERROR,
    }
}

fn io_error(err: io::Error, op: &str) -> BackendError {
    BackendError::new(io_code(&err), format!("{}: {}", op, err))
}

/// `Backend` for iOptron mounts reachable at a fixed set of port paths.
pub struct IOptronBackend {
    ports: Vec<String>,
    connector: Box<dyn PortConnector>,
    lines: HashMap<u64, Box<dyn LineTransport>>,
    next_handle: u64,
}

impl IOptronBackend {
    pub fn new(ports: Vec<String>, connector: Box<dyn PortConnector>) -> Self {
        Self {
            ports,
            connector,
            lines: HashMap::new(),
            next_handle: 1,
        }
    }

    fn line(&mut self, handle: Handle) -> Result<&mut Box<dyn LineTransport>, BackendError> {
        self.lines
            .get_mut(&handle.0)
            .ok_or_else(|| BackendError::new(code::PORT_CLOSED, "line is not open"))
    }

    fn open_now(&mut self, id: &BackendId) -> Result<Handle, BackendError> {
        if !self.ports.contains(&id.0) {
            return Err(BackendError::new(
                code::INVALID_PORT,
                format!("unknown port {}", id),
            ));
        }
        let line = self
            .connector
            .connect(&id.0)
            .map_err(|e| io_error(e, "open"))?;
        let handle = self.next_handle;
        self.next_handle += 1;
        self.lines.insert(handle, line);
        debug!("ioptron opened {} as {}", id, handle);
        Ok(Handle(handle))
    }
}

impl Backend for IOptronBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::IOptron
    }

    fn enumerate<'a>(&'a mut self) -> BackendFuture<'a, Vec<BackendId>> {
        let found = self
            .ports
            .iter()
            .filter(|path| self.connector.present(path))
            .map(|path| BackendId(path.clone()))
            .collect();
        Box::pin(std::future::ready(Ok(found)))
    }

    fn open<'a>(&'a mut self, id: &'a BackendId) -> BackendFuture<'a, Handle> {
        Box::pin(std::future::ready(self.open_now(id)))
    }

    fn close<'a>(&'a mut self, handle: Handle) -> BackendFuture<'a, ()> {
        let result = match self.lines.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(BackendError::new(code::PORT_CLOSED, "line is not open")),
        };
        Box::pin(std::future::ready(result))
    }

    fn send<'a>(&'a mut self, handle: Handle, payload: &'a [u8]) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let line = self.line(handle)?;
            line.clear_input();
            line.write(payload).await.map_err(|e| io_error(e, "send"))
        })
    }

    fn receive<'a>(&'a mut self, handle: Handle) -> BackendFuture<'a, Received> {
        Box::pin(async move {
            let line = self.line(handle)?;
            let bytes = line
                .read_available()
                .await
                .map_err(|e| io_error(e, "receive"))?;
            Ok(if bytes.is_empty() {
                Received::WouldBlock
            } else {
                Received::Bytes(bytes)
            })
        })
    }
}

#[cfg(feature = "serial")]
pub use serial::{SerialConnector, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use std::io;
    use std::path::Path;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;
    use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

    use super::{LineFuture, LineTransport, PortConnector};

    /// A mount on a tokio-serial port.
    pub struct SerialTransport {
        path: String,
        port: SerialStream,
    }

    impl SerialTransport {
        /// How long one receive waits for the first byte.
        const READ_POLL: Duration = Duration::from_millis(5);
        const READ_CHUNK: usize = 64;

        pub fn open(path: &str, baud: u32) -> io::Result<Self> {
            let port = tokio_serial::new(path, baud).open_native_async()?;
            Ok(Self {
                path: path.to_string(),
                port,
            })
        }

        /// A vanished device node means the adapter was unplugged.
        fn lost(&self, err: io::Error) -> io::Error {
            if Path::new(&self.path).exists() {
                err
            } else {
                io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    format!("{} disappeared: {}", self.path, err),
                )
            }
        }
    }

    impl LineTransport for SerialTransport {
        fn write<'a>(&'a mut self, data: &'a [u8]) -> LineFuture<'a, ()> {
            Box::pin(async move {
                let written = self.port.write_all(data).await;
                written.map_err(|e| self.lost(e))?;
                let flushed = self.port.flush().await;
                flushed.map_err(|e| self.lost(e))
            })
        }

        fn read_available<'a>(&'a mut self) -> LineFuture<'a, Vec<u8>> {
            Box::pin(async move {
                let mut buf = [0u8; Self::READ_CHUNK];
                let read = timeout(Self::READ_POLL, self.port.read(&mut buf)).await;
                match read {
                    Err(_) => Ok(Vec::new()),
                    Ok(Ok(0)) => Err(self.lost(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial line closed",
                    ))),
                    Ok(Ok(n)) => Ok(buf[..n].to_vec()),
                    Ok(Err(e)) => Err(self.lost(e)),
                }
            })
        }

        fn clear_input(&mut self) {
            let _ = self.port.clear(ClearBuffer::Input);
        }
    }

    /// Opens serial mounts at a fixed baud rate.
    #[derive(Debug, Clone, Copy)]
    pub struct SerialConnector {
        baud: u32,
    }

    impl SerialConnector {
        pub fn new(baud: u32) -> Self {
            Self { baud }
        }
    }

    impl PortConnector for SerialConnector {
        fn present(&self, path: &str) -> bool {
            Path::new(path).exists()
        }

        fn connect(&mut self, path: &str) -> io::Result<Box<dyn LineTransport>> {
            Ok(Box::new(SerialTransport::open(path, self.baud)?))
        }
    }
}
