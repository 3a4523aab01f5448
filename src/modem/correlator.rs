use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, trace, warn};
use crate::modem::buffer::{LineBuffer, AT_MESG_MAX_LINES};
use crate::modem::retry::RetryPolicy;
use crate::modem::transport::Transport;
use crate::modem::types::{AtError, AtReply, AtResult};

/// Longest single wait on the transport before the deadline and prompt are rechecked.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

const WRITE_RETRY: RetryPolicy = RetryPolicy::new(10, Duration::from_millis(100));
const READ_CHUNK_SIZE: usize = 1024;
const FLOOD_DRAIN_READS: usize = 64;

/// Builds an exchange deadline from the classic seconds + microseconds pair.
pub const fn at_timeout(seconds: u64, micros: u64) -> Duration {
    Duration::from_millis(seconds * 1000 + micros / 1000)
}

/// Receives every complete line, in arrival order, before terminal tokens are scanned for.
pub trait LineSink {
    fn on_line(&mut self, line: &str);
}
impl<F: FnMut(&str)> LineSink for F {
    fn on_line(&mut self, line: &str) {
        self(line)
    }
}

fn terminal_result(line: &str, expect: Option<&str>) -> Option<AtResult> {
    if let Some(expected) = expect {
        if line.starts_with(expected) {
            return Some(AtResult::Ok);
        }
    } else if line == "OK" {
        return Some(AtResult::Ok);
    }

    if line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR") {
        return Some(AtResult::Error);
    }
    None
}

struct AtLink<T> {
    stream: T,
    buffer: LineBuffer
}
impl<T: Transport> AtLink<T> {
    async fn write_retrying(&mut self, data: &[u8]) -> Result<(), AtError> {
        for byte in data {
            let mut backoff = WRITE_RETRY.start();
            loop {
                match self.stream.write(std::slice::from_ref(byte)).await {
                    Ok(1) => break,
                    Ok(written) => warn!("Short serial write of {} bytes, attempt {}", written, backoff.attempt()),
                    Err(e) => warn!("Serial write failed on attempt {}: {}", backoff.attempt(), e)
                }
                if !backoff.next().await {
                    error!("Giving up on serial write after {} attempts", backoff.attempt());
                    return Err(AtError::LinkDead(format!("write failed after {} attempts", backoff.attempt())));
                }
            }
        }
        self.stream.flush().await.map_err(|e| AtError::LinkDead(e.to_string()))
    }

    /// One bounded read. An elapsed wait means no data yet, EOF means the link is gone.
    async fn poll_once(&mut self, max_wait: Duration) -> Result<Vec<String>, AtError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        match timeout(max_wait.min(POLL_INTERVAL), self.stream.read(&mut chunk)).await {
            Err(_) => Ok(Vec::new()),
            Ok(Ok(0)) => Err(AtError::LinkDead("serial read returned no data".to_string())),
            Ok(Ok(read)) => Ok(self.buffer.process_data(&chunk[..read])),
            Ok(Err(e)) => Err(AtError::LinkDead(e.to_string()))
        }
    }

    /// Drops a partial line and whatever a flood still has queued on the transport.
    async fn discard_input(&mut self) {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        for _ in 0..FLOOD_DRAIN_READS {
            match timeout(POLL_INTERVAL, self.stream.read(&mut chunk)).await {
                Ok(Ok(read)) if read > 0 => trace!("Discarded {} bytes", read),
                _ => break
            }
        }
        self.buffer.clear();
    }

    /// Accumulates lines until a terminal token (when `scan` is set) or the deadline. Lines only
    /// reach `sink` once the whole cycle stayed within [`AT_MESG_MAX_LINES`].
    async fn collect(
        &mut self,
        expect: Option<&str>,
        expect_crlf: bool,
        wait: Duration,
        scan: bool,
        sink: &mut impl LineSink
    ) -> Result<AtReply, AtError> {
        let deadline = Instant::now() + wait;
        let mut received: Vec<String> = Vec::new();
        let mut terminal = None;

        while terminal.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let mut lines = self.poll_once(deadline - now).await?;
            if let Some(expected) = expect.filter(|_| !expect_crlf) {
                if let Some(prompt) = self.buffer.take_pending_if(expected) {
                    lines.push(prompt);
                }
            }

            if received.len() + lines.len() > AT_MESG_MAX_LINES {
                self.discard_input().await;
                return Err(AtError::TooManyLines(AT_MESG_MAX_LINES));
            }

            for line in lines {
                trace!("< {}", line);
                if scan && terminal.is_none() {
                    terminal = terminal_result(&line, expect).map(|result| (received.len() + 1, result));
                }
                received.push(line);
            }
        }

        // Unsolicited side effects land before the reply is judged.
        for line in &received {
            sink.on_line(line);
        }

        match terminal {
            Some((end, result)) => {
                received.truncate(end);
                Ok(AtReply {
                    result,
                    lines: received,
                    timed_out: false
                })
            },
            None => {
                // A reply cut off mid-line must not complete into the next exchange.
                if scan {
                    self.buffer.clear();
                }
                Ok(AtReply {
                    result: AtResult::Error,
                    lines: received,
                    timed_out: true
                })
            }
        }
    }
}

/// Serialises command/response exchanges over one transport.
pub struct AtChannel<T> {
    link: Mutex<AtLink<T>>
}
impl<T: Transport> AtChannel<T> {
    pub fn new(stream: T) -> Self {
        Self {
            link: Mutex::new(AtLink {
                stream,
                buffer: LineBuffer::new()
            })
        }
    }

    /// Writes `cmd` followed by CR and waits for `OK`, `ERROR` or the `expect` prefix.
    /// With `expect_crlf` unset, an unterminated line matching `expect` also completes.
    pub async fn send(
        &self,
        cmd: &str,
        expect: Option<&str>,
        expect_crlf: bool,
        wait: Duration,
        sink: &mut impl LineSink
    ) -> Result<AtReply, AtError> {
        let mut link = self.link.lock().await;
        debug!("> {}", cmd);

        let mut data = Vec::with_capacity(cmd.len() + 1);
        data.extend_from_slice(cmd.as_bytes());
        data.push(b'\r');
        link.write_retrying(&data).await?;

        Self::finish(cmd, link.collect(expect, expect_crlf, wait, true, sink).await)
    }

    /// Writes raw bytes (e.g. a PDU terminated by Ctrl-Z) without appending CR.
    pub async fn send_payload(
        &self,
        payload: &[u8],
        expect: Option<&str>,
        wait: Duration,
        sink: &mut impl LineSink
    ) -> Result<AtReply, AtError> {
        let mut link = self.link.lock().await;
        debug!("> <{} byte payload>", payload.len());

        link.write_retrying(payload).await?;
        Self::finish("payload", link.collect(expect, true, wait, true, sink).await)
    }

    /// Waits for a line starting with `expect` without writing anything.
    pub async fn wait_for(
        &self,
        expect: &str,
        wait: Duration,
        sink: &mut impl LineSink
    ) -> Result<AtReply, AtError> {
        let mut link = self.link.lock().await;
        Self::finish(expect, link.collect(Some(expect), true, wait, true, sink).await)
    }

    /// Reads whatever arrives within `wait`, handing each line to `sink`.
    pub async fn read_cycle(&self, wait: Duration, sink: &mut impl LineSink) -> Result<Vec<String>, AtError> {
        let mut link = self.link.lock().await;
        link.collect(None, true, wait, false, sink).await.map(|reply| reply.lines)
    }

    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if let Err(e) = link.stream.shutdown().await {
            debug!("Error while closing serial link: {}", e);
        }
    }

    /// A line flood fails the exchange but leaves the session running.
    fn finish(what: &str, result: Result<AtReply, AtError>) -> Result<AtReply, AtError> {
        match result {
            Err(AtError::TooManyLines(limit)) => {
                warn!("Reply to {:?} exceeded {} lines, treating it as ERROR", what, limit);
                Ok(AtReply {
                    result: AtResult::Error,
                    lines: Vec::new(),
                    timed_out: false
                })
            },
            other => other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    async fn read_command(modem: &mut DuplexStream) -> String {
        let mut command = Vec::new();
        let mut byte = [0u8; 1];
        while modem.read_exact(&mut byte).await.is_ok() && byte[0] != b'\r' {
            command.push(byte[0]);
        }
        String::from_utf8(command).unwrap()
    }

    #[test]
    fn test_at_timeout() {
        assert_eq!(at_timeout(1, 500_000), Duration::from_millis(1500));
        assert_eq!(at_timeout(0, 999), Duration::ZERO);
    }

    #[test]
    fn test_terminal_result() {
        assert_eq!(terminal_result("OK", None), Some(AtResult::Ok));
        assert_eq!(terminal_result("+CME ERROR: 10", None), Some(AtResult::Error));
        assert_eq!(terminal_result("OK", Some("+CUSD")), None);
        assert_eq!(terminal_result("+CUSD: 0,\"AA\",15", Some("+CUSD")), Some(AtResult::Ok));
        assert_eq!(terminal_result("RING", None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_after_deadline() {
        let (client, _modem) = duplex(1024);
        let channel = AtChannel::new(client);

        let started = Instant::now();
        let reply = channel
            .send("AT+CSQ", None, true, Duration::from_millis(500), &mut |_: &str| {})
            .await
            .unwrap();

        let elapsed = started.elapsed();
        assert_eq!(reply.result, AtResult::Error);
        assert!(reply.timed_out);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed <= Duration::from_millis(500) + POLL_INTERVAL);
    }

    #[tokio::test]
    async fn test_send_interprets_interleaved_lines_first() {
        let (client, mut modem) = duplex(1024);
        let channel = AtChannel::new(client);

        let responder = tokio::spawn(async move {
            let command = read_command(&mut modem).await;
            modem.write_all(b"\r\nRING\r\n+CSQ: 15,99\r\nOK\r\n").await.unwrap();
            (command, modem)
        });

        let mut seen = Vec::new();
        let reply = channel
            .send("AT+CSQ", None, true, Duration::from_secs(2), &mut |line: &str| seen.push(line.to_string()))
            .await
            .unwrap();

        let (command, _modem) = responder.await.unwrap();
        assert_eq!(command, "AT+CSQ");
        assert!(reply.is_ok());
        assert_eq!(reply.lines, vec!["RING", "+CSQ: 15,99", "OK"]);
        assert_eq!(seen, reply.lines);
    }

    #[tokio::test]
    async fn test_send_accepts_prompt_without_crlf() {
        let (client, mut modem) = duplex(1024);
        let channel = AtChannel::new(client);

        let responder = tokio::spawn(async move {
            read_command(&mut modem).await;
            modem.write_all(b"\r\n> ").await.unwrap();
            modem
        });

        let reply = channel
            .send("AT+CMGS=23", Some("> "), false, Duration::from_secs(1), &mut |_: &str| {})
            .await
            .unwrap();
        let _modem = responder.await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.lines, vec!["> "]);
    }

    #[tokio::test]
    async fn test_error_reply() {
        let (client, mut modem) = duplex(1024);
        let channel = AtChannel::new(client);

        let responder = tokio::spawn(async move {
            read_command(&mut modem).await;
            modem.write_all(b"\r\n+CMS ERROR: 500\r\n").await.unwrap();
            modem
        });

        let reply = channel
            .send("AT+CMGS=23", None, true, Duration::from_secs(1), &mut |_: &str| {})
            .await
            .unwrap();
        let _modem = responder.await.unwrap();
        assert_eq!(reply.result, AtResult::Error);
        assert!(!reply.timed_out);
    }

    #[tokio::test]
    async fn test_line_flood() {
        let (client, mut modem) = duplex(4096);
        let channel = AtChannel::new(client);

        let flood: String = (0..=AT_MESG_MAX_LINES).map(|i| format!("+CIEV: 9,{}\r\n", i)).collect();
        modem.write_all(flood.as_bytes()).await.unwrap();

        let mut seen = 0;
        let result = channel.read_cycle(Duration::from_millis(200), &mut |_: &str| seen += 1).await;
        assert!(matches!(result, Err(AtError::TooManyLines(AT_MESG_MAX_LINES))));
        assert_eq!(seen, 0);

        // The same flood during an exchange fails that exchange only.
        let responder = tokio::spawn(async move {
            read_command(&mut modem).await;
            modem.write_all(flood.as_bytes()).await.unwrap();
            modem.write_all(b"OK\r\n").await.unwrap();
            modem
        });
        let reply = channel
            .send("AT", None, true, Duration::from_millis(500), &mut |_: &str| {})
            .await
            .unwrap();
        let _modem = responder.await.unwrap();
        assert_eq!(reply.result, AtResult::Error);
    }

    #[tokio::test]
    async fn test_flood_across_reads_delivers_nothing() {
        let (client, mut modem) = duplex(4096);
        let channel = AtChannel::new(client);

        let writer = tokio::spawn(async move {
            let first: String = (0..10).map(|i| format!("+CIEV: 9,{}\r\n", i)).collect();
            modem.write_all(format!("\r\n+CUSD: 0,\"Hello\",15\r\n{}", first).as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
            let second: String = (10..21).map(|i| format!("+CIEV: 9,{}\r\n", i)).collect();
            modem.write_all(second.as_bytes()).await.unwrap();
            modem
        });

        let mut seen = Vec::new();
        let result = channel
            .read_cycle(Duration::from_millis(200), &mut |line: &str| seen.push(line.to_string()))
            .await;
        let _modem = writer.await.unwrap();
        assert!(matches!(result, Err(AtError::TooManyLines(AT_MESG_MAX_LINES))));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_cut_off_reply_does_not_leak_into_next_exchange() {
        let (client, mut modem) = duplex(1024);
        let channel = AtChannel::new(client);

        let responder = tokio::spawn(async move {
            read_command(&mut modem).await;
            modem.write_all(b"\r\n+CGSN: 3569").await.unwrap();
            read_command(&mut modem).await;
            modem.write_all(b"\r\nOK\r\n").await.unwrap();
            modem
        });

        let reply = channel
            .send("AT+CGSN", None, true, Duration::from_millis(100), &mut |_: &str| {})
            .await
            .unwrap();
        assert!(reply.timed_out);

        let reply = channel
            .send("AT", None, true, Duration::from_secs(1), &mut |_: &str| {})
            .await
            .unwrap();
        let _modem = responder.await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(reply.lines, vec!["OK"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_dead() {
        let (client, modem) = duplex(1024);
        let channel = AtChannel::new(client);
        drop(modem);

        let result = channel.read_cycle(Duration::from_millis(100), &mut |_: &str| {}).await;
        assert!(matches!(result, Err(AtError::LinkDead(_))));

        let result = channel.send("AT", None, true, Duration::from_millis(100), &mut |_: &str| {}).await;
        assert!(matches!(result, Err(AtError::LinkDead(_))));
    }
}
