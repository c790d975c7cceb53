use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::FtpTarget;
use crate::error::SourceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    /// Text of every reply line, joined with `\n`.
    pub message: String,
}

impl Reply {
    pub fn is(&self, class: u16) -> bool {
        self.code / 100 == class
    }

    /// Converts an unexpected reply into an error about `path`.
    pub fn into_error(self, path: &str) -> SourceError {
        let lower = self.message.to_ascii_lowercase();
        if self.code == 550 && !lower.contains("permission") && !lower.contains("denied") {
            SourceError::NotFound(path.to_string())
        } else {
            SourceError::Transport(format!("{path}: ftp {} {}", self.code, self.message))
        }
    }
}

/// One logged-in FTP control connection.
pub struct FtpControl {
    stream: BufReader<TcpStream>,
    peer: SocketAddr,
    mlst: bool,
    epsv: bool,
    /// Set while a reply is still owed or after an I/O failure.
    broken: bool,
}

impl FtpControl {
    pub async fn connect(target: &FtpTarget) -> Result<Self, SourceError> {
        let stream = tokio::time::timeout(
            target.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| SourceError::Transport(format!("ftp connect to {} timed out", target.host)))??;
        let peer = stream.peer_addr()?;
        let mut control = Self {
            stream: BufReader::new(stream),
            peer,
            mlst: false,
            epsv: true,
            broken: false,
        };

        let greeting = control.read_reply().await?;
        if !greeting.is(2) {
            return Err(greeting.into_error(&target.host));
        }
        control.login(&target.username, &target.password).await?;

        let binary = control.command("TYPE I").await?;
        if !binary.is(2) {
            return Err(binary.into_error("TYPE I"));
        }
        let features = control.command("FEAT").await?;
        control.mlst = features.is(2)
            && features
                .message
                .lines()
                .any(|line| line.trim().to_ascii_uppercase().starts_with("MLST"));
        debug!(host = %target.host, mlst = control.mlst, "ftp session ready");
        Ok(control)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<(), SourceError> {
        let user = self.command(&format!("USER {username}")).await?;
        let reply = match user.code {
            230 => return Ok(()),
            331 | 332 => self.send_password(password).await?,
            _ => user,
        };
        if reply.is(2) {
            Ok(())
        } else {
            Err(SourceError::Transport(format!(
                "ftp login rejected for {username}: {} {}",
                reply.code, reply.message
            )))
        }
    }

    async fn send_password(&mut self, password: &str) -> Result<Reply, SourceError> {
        self.write_line(&format!("PASS {password}")).await?;
        debug!("ftp > PASS ****");
        self.read_reply().await
    }

    pub fn supports_mlst(&self) -> bool {
        self.mlst
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub async fn command(&mut self, line: &str) -> Result<Reply, SourceError> {
        debug!(command = line, "ftp >");
        self.write_line(line).await?;
        self.read_reply().await
    }

    /// Sends `line` and fails unless the reply is in `class` (2 for 2xx, ...).
    pub async fn expect(
        &mut self,
        line: &str,
        class: u16,
        path: &str,
    ) -> Result<Reply, SourceError> {
        let reply = self.command(line).await?;
        if reply.is(class) {
            Ok(reply)
        } else {
            Err(reply.into_error(path))
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SourceError> {
        if line.contains(['\r', '\n']) {
            return Err(SourceError::InvalidOperation(format!(
                "line break in ftp command {:?}",
                line.split_whitespace().next().unwrap_or_default()
            )));
        }
        let result = async {
            let stream = self.stream.get_mut();
            stream.write_all(line.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        }
        .await;
        if result.is_err() {
            self.broken = true;
        }
        Ok(result?)
    }

    pub async fn read_reply(&mut self) -> Result<Reply, SourceError> {
        let first = self.read_line().await?;
        let code = reply_code(&first)?;
        let mut lines = vec![first[3..].trim_start_matches([' ', '-']).to_string()];
        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&terminator) || line == code.to_string() {
                    lines.push(line[3..].trim().to_string());
                    break;
                }
                lines.push(line);
            }
        }
        let reply = Reply {
            code,
            message: lines.join("\n"),
        };
        debug!(code = reply.code, "ftp <");
        Ok(reply)
    }

    async fn read_line(&mut self) -> Result<String, SourceError> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await;
        match read {
            Ok(0) => {
                self.broken = true;
                Err(SourceError::Transport(
                    "ftp control connection closed".to_string(),
                ))
            }
            Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(err) => {
                self.broken = true;
                Err(err.into())
            }
        }
    }

    /// Opens a passive data connection, preferring EPSV.
    async fn open_data(&mut self) -> Result<TcpStream, SourceError> {
        let addr = if self.epsv {
            let reply = self.command("EPSV").await?;
            if reply.code == 229 {
                Some(SocketAddr::new(self.peer.ip(), parse_epsv(&reply.message)?))
            } else {
                self.epsv = false;
                None
            }
        } else {
            None
        };
        let addr = match addr {
            Some(addr) => addr,
            None => {
                let reply = self.command("PASV").await?;
                if reply.code != 227 {
                    return Err(reply.into_error("PASV"));
                }
                SocketAddr::new(self.peer.ip(), parse_pasv(&reply.message)?)
            }
        };
        Ok(TcpStream::connect(addr).await?)
    }

    /// Runs a data command such as `RETR` and returns the open data stream.
    ///
    /// The caller must finish with [`FtpControl::finish_data`].
    pub async fn start_data(&mut self, line: &str, path: &str) -> Result<TcpStream, SourceError> {
        let data = self.open_data().await?;
        let reply = self.command(line).await?;
        if reply.is(1) {
            self.broken = true;
            Ok(data)
        } else if reply.is(2) {
            // some servers answer 226 right away for empty transfers
            self.broken = false;
            Ok(data)
        } else {
            drop(data);
            Err(reply.into_error(path))
        }
    }

    pub async fn finish_data(&mut self, path: &str) -> Result<(), SourceError> {
        if !self.broken {
            return Ok(());
        }
        let reply = self.read_reply().await?;
        self.broken = false;
        if reply.is(2) {
            Ok(())
        } else {
            Err(reply.into_error(path))
        }
    }

    /// Reads a whole listing (`MLSD`/`LIST`) into memory.
    pub async fn read_listing(&mut self, line: &str, path: &str) -> Result<String, SourceError> {
        let mut data = self.start_data(line, path).await?;
        let mut raw = Vec::new();
        data.read_to_end(&mut raw).await?;
        drop(data);
        self.finish_data(path).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    pub async fn quit(mut self) {
        if !self.broken {
            let _ = tokio::time::timeout(Duration::from_secs(2), self.command("QUIT")).await;
        }
    }
}

fn reply_code(line: &str) -> Result<u16, SourceError> {
    line.get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| SourceError::Transport(format!("malformed ftp reply {line:?}")))
}

/// Port from `229 Entering Extended Passive Mode (|||6446|)`.
fn parse_epsv(message: &str) -> Result<u16, SourceError> {
    let start = message.find("|||").map(|idx| idx + 3);
    start
        .and_then(|start| {
            let rest = &message[start..];
            rest.find('|').and_then(|end| rest[..end].parse().ok())
        })
        .ok_or_else(|| SourceError::Transport(format!("malformed EPSV reply {message:?}")))
}

/// Port from `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
fn parse_pasv(message: &str) -> Result<u16, SourceError> {
    let malformed = || SourceError::Transport(format!("malformed PASV reply {message:?}"));
    let start = message.find('(').ok_or_else(malformed)?;
    let end = message[start..].find(')').ok_or_else(malformed)? + start;
    let numbers: Vec<u16> = message[start + 1..end]
        .split(',')
        .map(|part| part.trim().parse::<u16>())
        .collect::<Result<_, _>>()
        .map_err(|_| malformed())?;
    match numbers.as_slice() {
        [_, _, _, _, high, low] if *high < 256 && *low < 256 => Ok(high * 256 + low),
        _ => Err(malformed()),
    }
}

/// Directory name from a `257 "/home/ann" is the current directory` reply.
pub fn parse_pwd(message: &str) -> Option<String> {
    let start = message.find('"')? + 1;
    let mut path = String::new();
    let mut chars = message[start..].chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                path.push('"');
            } else {
                return Some(path);
            }
        } else {
            path.push(ch);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_passive_replies() {
        assert_eq!(
            parse_epsv("Entering Extended Passive Mode (|||6446|)").unwrap(),
            6446
        );
        assert_eq!(
            parse_pasv("Entering Passive Mode (192,168,1,2,19,137).").unwrap(),
            19 * 256 + 137
        );
        assert!(parse_pasv("Entering Passive Mode").is_err());
        assert!(parse_epsv("Entering Extended Passive Mode").is_err());
    }

    #[test]
    fn parses_pwd_with_escaped_quotes() {
        assert_eq!(
            parse_pwd(r#""/home/ann" is the current directory"#).as_deref(),
            Some("/home/ann")
        );
        assert_eq!(
            parse_pwd(r#""/odd ""name""" created"#).as_deref(),
            Some(r#"/odd "name""#)
        );
        assert_eq!(parse_pwd("no quotes"), None);
    }

    #[test]
    fn maps_missing_files_to_not_found() {
        let missing = Reply {
            code: 550,
            message: "No such file or directory".into(),
        };
        assert!(matches!(missing.into_error("/x"), SourceError::NotFound(path) if path == "/x"));

        let denied = Reply {
            code: 550,
            message: "Permission denied".into(),
        };
        assert!(matches!(denied.into_error("/x"), SourceError::Transport(_)));
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(reply_code("2x0 hello").is_err());
        assert_eq!(reply_code("226 Transfer complete").unwrap(), 226);
    }
}
