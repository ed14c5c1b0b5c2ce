use anyhow::{anyhow, bail, Context, Result};
use std::{
    env,
    io::{BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

const READ_BUFFER_SIZE: usize = 8192;

/// Where the engine daemon listens. Only unix sockets are supported; a
/// `DOCKER_HOST` pointing anywhere else is rejected outright.
#[derive(Clone, Debug)]
pub struct EngineTransport {
    socket_path: PathBuf,
}

impl EngineTransport {
    pub fn from_env() -> Result<EngineTransport> {
        match env::var("DOCKER_HOST") {
            Ok(host) => EngineTransport::from_docker_host(&host),
            Err(_) => Ok(EngineTransport {
                socket_path: PathBuf::from(DEFAULT_SOCKET),
            }),
        }
    }

    fn from_docker_host(host: &str) -> Result<EngineTransport> {
        match host.strip_prefix("unix://") {
            Some(path) if !path.is_empty() => Ok(EngineTransport {
                socket_path: PathBuf::from(path),
            }),
            _ => bail!(
                "unsupported DOCKER_HOST {:?}, only unix:// sockets are supported",
                host
            ),
        }
    }

    /// One request on a fresh connection. The connection is handed to the
    /// response body so streaming endpoints can be drained lazily.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<&[u8]>,
    ) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "failed to connect to the docker daemon at {}",
                self.socket_path.display()
            )
        })?;

        let mut request = format!(
            "{} {} HTTP/1.1\r\nHost: docker\r\nConnection: close\r\n",
            method, path
        );
        for (key, value) in headers {
            request.push_str(key);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        if let Some(body) = body {
            request.push_str("Content-Length: ");
            request.push_str(&body.len().to_string());
            request.push_str("\r\n");
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes())?;
        if let Some(body) = body {
            stream.write_all(body)?;
        }

        let mut reader = BufReader::new(stream);
        let status = read_status_line(&mut reader)?;
        let framing = read_headers(&mut reader)?;

        Ok(Response {
            status,
            body: BodyChunks::new(reader, framing),
        })
    }
}

pub struct Response {
    pub status: u16,
    pub body: BodyChunks<BufReader<UnixStream>>,
}

impl Response {
    /// Drains the whole body, for the endpoints that reply in one piece.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for chunk in self.body {
            bytes.extend_from_slice(&chunk?);
        }

        Ok(bytes)
    }
}

fn read_status_line<R: BufRead>(reader: &mut R) -> Result<u16> {
    let mut line = String::new();
    reader.read_line(&mut line)?;

    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed status line from the docker daemon: {:?}", line))
}

fn read_headers<R: BufRead>(reader: &mut R) -> Result<Framing> {
    let mut framing = Framing::Eof;

    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 || line.trim_end().is_empty() {
            break;
        }

        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            if key == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
                framing = Framing::Chunked;
            } else if key == "content-length" && !matches!(framing, Framing::Chunked) {
                // Chunked framing wins whatever order the headers arrive in.
                let length = value.parse::<u64>().with_context(|| {
                    format!("invalid content-length from the docker daemon: {:?}", value)
                })?;
                framing = Framing::Length(length);
            }
        }
    }

    Ok(framing)
}

#[derive(Copy, Clone, Debug)]
enum Framing {
    Chunked,
    Length(u64),
    Eof,
}

/// Lazily decoded response body. HTTP chunk framing is undone here; the
/// payload inside is handed out exactly as the daemon wrote it.
pub struct BodyChunks<R: BufRead> {
    reader: R,
    framing: Framing,
    done: bool,
}

impl<R: BufRead> BodyChunks<R> {
    fn new(reader: R, framing: Framing) -> BodyChunks<R> {
        BodyChunks {
            reader,
            framing,
            done: false,
        }
    }

    fn next_chunked(&mut self) -> Result<Option<Vec<u8>>> {
        let mut size_line = String::new();
        self.reader.read_line(&mut size_line)?;

        // Chunk extensions after a ';' are ignored.
        let size_field = size_line.trim();
        let size_field = size_field.split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_field, 16).with_context(|| {
            format!("invalid chunk size from the docker daemon: {:?}", size_line)
        })?;

        if size == 0 {
            let mut terminator = String::new();
            self.reader.read_line(&mut terminator)?;
            return Ok(None);
        }

        let mut chunk = vec![0; size];
        self.reader.read_exact(&mut chunk)?;

        let mut terminator = [0; 2];
        self.reader.read_exact(&mut terminator)?;

        Ok(Some(chunk))
    }

    fn next_length(&mut self, remaining: u64) -> Result<Option<Vec<u8>>> {
        if remaining == 0 {
            return Ok(None);
        }

        let size = remaining.min(READ_BUFFER_SIZE as u64) as usize;
        let mut chunk = vec![0; size];
        self.reader.read_exact(&mut chunk)?;
        self.framing = Framing::Length(remaining - size as u64);

        Ok(Some(chunk))
    }

    fn next_eof(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0; READ_BUFFER_SIZE];
        let read = self.reader.read(&mut chunk)?;
        if read == 0 {
            return Ok(None);
        }

        chunk.truncate(read);
        Ok(Some(chunk))
    }
}

impl<R: BufRead> Iterator for BodyChunks<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Result<Vec<u8>>> {
        if self.done {
            return None;
        }

        let next = match self.framing {
            Framing::Chunked => self.next_chunked(),
            Framing::Length(remaining) => self.next_length(remaining),
            Framing::Eof => self.next_eof(),
        };

        match next {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}
