use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use crate::config::InterfaceConfig;
use crate::events::Event;
use crate::modem::commands::OutgoingCommand;
use crate::modem::correlator::{at_timeout, AtChannel};
use crate::modem::parsers;
use crate::modem::retry::RetryPolicy;
use crate::modem::session::{PendingAction, SessionState, SmsMode};
use crate::modem::state_machine::CallSignal;
use crate::modem::transport::Transport;
use crate::modem::types::{
    Alarm,
    AtError,
    AtReply,
    HangupCause,
    InterfaceRequest,
    InterfaceResponse,
    InterfaceState,
    InterfaceStatus,
    SessionError
};
use crate::sms::{self, alphabet, SmsError, SmsMessage};
use crate::ussd::{self, UssdEncoding, UssdError, UssdMessage};

const ACK_TIMEOUT: Duration = at_timeout(2, 0);
const PROMPT_TIMEOUT: Duration = at_timeout(1, 0);
const LONG_TIMEOUT: Duration = at_timeout(20, 0);
const IDLE_READ: Duration = Duration::from_millis(100);
const ANSWER_TICK: Duration = Duration::from_millis(10);
const UNSOLICITED_SYNC_PERIOD: Duration = Duration::from_secs(30);
const PHONEBOOK_MAX_ENTRIES: u32 = 15;
const CTRL_Z: u8 = 0x1A;

/// One modem: its link, its call state and the cached facts it reported.
pub struct InterfaceSession<T> {
    config: Arc<InterfaceConfig>,
    channel: AtChannel<T>,
    state: SessionState,
    sync_period: Duration,
    sms_reference: u8,
    global_running: Arc<AtomicBool>,
    running: Arc<AtomicBool>
}
impl<T: Transport> InterfaceSession<T> {
    pub fn new(
        config: Arc<InterfaceConfig>,
        stream: T,
        events: mpsc::UnboundedSender<Event>,
        global_running: Arc<AtomicBool>,
        running: Arc<AtomicBool>
    ) -> Self {
        Self {
            sync_period: config.sync_period(),
            state: SessionState::new(Arc::clone(&config), events),
            channel: AtChannel::new(stream),
            config,
            sms_reference: 0,
            global_running,
            running
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_running(&self) -> bool {
        self.global_running.load(Ordering::Relaxed) && self.running.load(Ordering::Relaxed)
    }

    /// One exchange; URCs that arrive meanwhile update the session before the reply is judged.
    async fn exchange(
        &mut self,
        cmd: &str,
        expect: Option<&str>,
        expect_crlf: bool,
        wait: Duration
    ) -> Result<AtReply, AtError> {
        self.channel.send(cmd, expect, expect_crlf, wait, &mut self.state).await
    }

    async fn command(&mut self, cmd: &str) -> Result<AtReply, AtError> {
        self.exchange(cmd, None, true, ACK_TIMEOUT).await
    }

    /// Sends a command whose failure only deserves a log line.
    async fn optional(&mut self, cmd: &str) -> Result<bool, AtError> {
        let reply = self.command(cmd).await?;
        if !reply.is_ok() {
            debug!("[{}] {} failed, continuing", self.name(), cmd);
        }
        Ok(reply.is_ok())
    }

    async fn read_cycle(&mut self, wait: Duration) -> Result<(), AtError> {
        match self.channel.read_cycle(wait, &mut self.state).await {
            Ok(_) => Ok(()),
            Err(AtError::TooManyLines(limit)) => {
                warn!("[{}] Discarded a read cycle of more than {} lines", self.name(), limit);
                Ok(())
            },
            Err(e) => Err(e)
        }
    }

    pub async fn initialize(&mut self) -> Result<(), SessionError> {
        let config = Arc::clone(&self.config);
        info!("[{}] Initializing modem on {}", self.name(), config.device);

        sleep(Duration::from_millis(config.initial_pause_ms)).await;
        for cmd in &config.dialect.preinit {
            self.optional(cmd).await?;
        }
        sleep(Duration::from_millis(config.after_preinit_pause_ms)).await;

        self.command("AT").await?.require("AT")?;
        self.optional("ATZ").await?;
        self.optional("ATE0").await?;
        self.optional("AT+CMEE=0").await?;

        let manufacturer = self.command("AT+CGMI").await?;
        self.state.info.manufacturer = manufacturer.information(&config.dialect).map(str::to_string);
        let model = self.command("AT+CGMM").await?;
        self.state.info.model = model.information(&config.dialect).map(str::to_string);
        info!(
            "[{}] Modem is {} {}",
            self.name(),
            self.state.info.manufacturer.as_deref().unwrap_or("unknown"),
            self.state.info.model.as_deref().unwrap_or("unknown")
        );

        if !self.optional("AT+CREG=1").await? {
            warn!("[{}] Modem doesn't report network registration", self.name());
            self.state.caps.creg_supported = false;
        }
        if self.state.caps.creg_supported {
            self.optional("AT+CREG?").await?;
        }
        self.optional(&config.dialect.query_signal).await?;

        let mut imei = self.command("AT+GSN").await?;
        if !imei.is_ok() {
            imei = self.command("AT+CGSN").await?;
        }
        self.state.info.imei = imei.information(&config.dialect).map(str::to_string);
        let imsi = self.command("AT+CIMI").await?;
        self.state.info.imsi = imsi.information(&config.dialect).map(str::to_string);

        if !self.optional("AT+CNMI=2,1,0,0,0").await? {
            warn!("[{}] Modem doesn't announce new messages, polling status every {:?}", self.name(), UNSOLICITED_SYNC_PERIOD);
            self.state.caps.cnmi_supported = false;
            self.sync_period = self.sync_period.min(UNSOLICITED_SYNC_PERIOD);
        }
        self.optional("AT+CPMS=\"ME\",\"ME\",\"ME\"").await?;
        self.negotiate_sms_mode().await?;

        self.optional("AT+CMER=3,0,0,1").await?;
        if self.optional("AT*ECAM=1").await? {
            self.state.caps.has_ecam = true;
        }
        if self.optional("AT+CLCC=0").await? {
            self.state.caps.has_clcc = true;
        }
        self.optional("AT+CLIP=1").await?;
        self.optional("AT+MCST=1").await?;

        for cmd in &config.dialect.postinit {
            self.optional(cmd).await?;
        }

        info!("[{}] Modem initialized: {:?}", self.name(), self.state.caps);
        Ok(())
    }

    /// PDU mode first; text mode is remembered for the session when PDU is refused.
    async fn negotiate_sms_mode(&mut self) -> Result<(), AtError> {
        if self.optional("AT+CMGF=0").await? {
            self.state.caps.sms_mode = SmsMode::Pdu;
            return Ok(());
        }

        warn!("[{}] PDU mode refused, falling back to text mode", self.name());
        self.state.caps.sms_mode = SmsMode::Text;
        self.optional("AT+CMGF=1").await?;
        if !self.state.caps.no_ucs2 && !self.optional("AT+CSCS=\"UCS2\"").await? {
            warn!("[{}] UCS2 character set refused, text messages will be sent as plain text", self.name());
            self.state.caps.no_ucs2 = true;
        }
        Ok(())
    }

    pub async fn dial(&mut self, number: &str) -> Result<(), SessionError> {
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit() || "+*#".contains(c)) {
            return Err(SessionError::InvalidArgument(format!("{:?} is not a dialable number", number)));
        }
        self.state.calls.begin_dial(number)?;

        let config = Arc::clone(&self.config);
        let dialect = &config.dialect;
        let cmd = format!("{}{}{}", dialect.dial_pre_number, number, dialect.dial_post_number);

        let reply = match self.exchange(&cmd, Some(dialect.dial_expect.as_str()), true, ACK_TIMEOUT).await {
            Ok(reply) => reply,
            Err(e) => {
                self.state.calls.dial_failed();
                return Err(e.into());
            }
        };
        if let Err(e) = reply.require(&cmd) {
            error!("[{}] Dial command failed: {}", self.name(), e);
            self.state.calls.dial_failed();
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn answer(&mut self) -> Result<(), SessionError> {
        self.state.calls.begin_answer()?;

        let config = Arc::clone(&self.config);
        let dialect = &config.dialect;
        let reply = self.exchange(&dialect.answer, Some(dialect.answer_expect.as_str()), true, ACK_TIMEOUT).await?;
        if !reply.is_ok() {
            warn!("[{}] {} failed, trying key press", self.name(), dialect.answer);
            self.command("AT+CKPD=\"S\"").await?.require("AT+CKPD=\"S\"")?;
        }

        // The call is up only once the modem says so.
        let mut ticks = RetryPolicy::spanning(config.answer_timeout(), ANSWER_TICK).start();
        while self.state.calls.interface() == InterfaceState::Ring {
            self.drain_pending().await?;
            if !ticks.tick() {
                break;
            }
            self.read_cycle(ANSWER_TICK).await?;
        }

        match self.state.calls.interface() {
            InterfaceState::Up => Ok(()),
            state => {
                warn!("[{}] Call not answered, interface is {:?}", self.name(), state);
                Err(SessionError::NotAnswered(state))
            }
        }
    }

    pub async fn hangup(&mut self) -> Result<(), SessionError> {
        self.hangup_with(HangupCause::Normal).await
    }

    async fn hangup_with(&mut self, cause: HangupCause) -> Result<(), SessionError> {
        if !self.state.calls.begin_hangup() {
            debug!("[{}] Nothing to hang up", self.name());
            return Ok(());
        }

        let config = Arc::clone(&self.config);
        let dialect = &config.dialect;
        let mut result = self.exchange(&dialect.hangup, Some(dialect.hangup_expect.as_str()), true, ACK_TIMEOUT).await;
        if matches!(&result, Ok(reply) if !reply.is_ok()) {
            warn!("[{}] {} failed, trying key press", self.name(), dialect.hangup);
            result = self.command("AT+CKPD=\"EEE\"").await;
        }

        // Local state goes down whatever the modem said.
        let actions = self.state.calls.finish_hangup(cause);
        self.state.perform(actions);

        match result {
            Ok(reply) if !reply.is_ok() => {
                error!("[{}] Modem refused to hang up, state was reset locally", self.name());
                Ok(())
            },
            Ok(_) => Ok(()),
            Err(e) => Err(e.into())
        }
    }

    pub async fn send_dtmf(&mut self, digit: char) -> Result<(), SessionError> {
        if !(digit.is_ascii_digit() || "*#ABCD".contains(digit)) {
            return Err(SessionError::InvalidArgument(format!("{:?} is not a DTMF digit", digit)));
        }
        if self.state.calls.interface() != InterfaceState::Up {
            return Err(SessionError::InvalidState {
                operation: "send_dtmf",
                state: self.state.calls.interface()
            });
        }

        let cmd = format!("{}=1,{}", self.config.dialect.send_dtmf, digit);
        self.command(&cmd).await?.require(&cmd)?;
        Ok(())
    }

    /// Submits a message, split into concatenated parts when needed. Returns the message references.
    pub async fn send_sms(&mut self, to: &str, content: &str) -> Result<Vec<u8>, SessionError> {
        match self.state.caps.sms_mode {
            SmsMode::Pdu => self.send_sms_pdu(to, content).await,
            SmsMode::Text => self.send_sms_text(to, content).await
        }
    }

    async fn send_sms_pdu(&mut self, to: &str, content: &str) -> Result<Vec<u8>, SessionError> {
        self.sms_reference = self.sms_reference.wrapping_add(1);
        let parts = sms::encode_submit_parts(to, content, !self.state.caps.no_ucs2, self.sms_reference)?;
        debug!("[{}] Sending SMS to {} in {} part(s)", self.name(), to, parts.len());

        let mut references = Vec::with_capacity(parts.len());
        for part in parts {
            let cmd = format!("AT+CMGS={}", part.tpdu_len);
            let mut payload = part.hex.into_bytes();
            payload.push(CTRL_Z);

            if let Some(reference) = self.submit(&cmd, &payload).await? {
                references.push(reference);
            }
        }
        Ok(references)
    }

    async fn send_sms_text(&mut self, to: &str, content: &str) -> Result<Vec<u8>, SessionError> {
        self.optional("AT+CMGF=1").await?;

        let ucs2 = !self.state.caps.no_ucs2;
        let (destination, mut payload) = if ucs2 {
            self.optional("AT+CSCS=\"UCS2\"").await?;
            (alphabet::ucs2_hex(to), alphabet::ucs2_hex(content).into_bytes())
        } else {
            if let Some(c) = content.chars().find(|c| !c.is_ascii()) {
                return Err(SmsError::Unencodable(c).into());
            }
            (to.to_string(), content.as_bytes().to_vec())
        };
        payload.push(CTRL_Z);

        let cmd = format!("AT+CMGS=\"{}\"", destination);
        Ok(self.submit(&cmd, &payload).await?.into_iter().collect())
    }

    /// `AT+CMGS`, wait for the prompt, then the body terminated by Ctrl-Z.
    async fn submit(&mut self, cmd: &str, payload: &[u8]) -> Result<Option<u8>, SessionError> {
        self.exchange(cmd, Some("> "), false, PROMPT_TIMEOUT).await?.require(cmd)?;

        let reply = self.channel
            .send_payload(payload, None, LONG_TIMEOUT, &mut self.state)
            .await?
            .require(cmd)?;

        let reference = reply
            .find("+CMGS:")
            .and_then(|line| parsers::parse_cmgs_result(line)
                .inspect_err(|e| warn!("Could not read message reference: {}", e))
                .ok());
        debug!("[{}] Message submitted, reference {:?}", self.name(), reference);
        Ok(reference)
    }

    pub async fn send_ussd(&mut self, code: &str) -> Result<Option<UssdMessage>, SessionError> {
        let encoding = self.state.caps.ussd_request_encoding;
        self.state.last_ussd = None;

        let cmd = ussd::request_command(&ussd::encode_request(code, encoding)?);
        let mut reply = self.command(&cmd).await?;

        if !reply.is_ok() && encoding == UssdEncoding::Auto {
            warn!("[{}] Plain USSD request refused, retrying as hex7", self.name());
            let cmd = ussd::request_command(&ussd::encode_request(code, UssdEncoding::Hex7)?);
            reply = self.command(&cmd).await?;
            if reply.is_ok() {
                info!("[{}] Modem wants hex7 USSD requests, remembering that", self.name());
                self.state.caps.ussd_request_encoding = UssdEncoding::Hex7;
            }
        }
        if !reply.is_ok() {
            return Err(UssdError::Rejected(code.to_string()).into());
        }

        if self.state.last_ussd.is_none() {
            let waited = self.channel.wait_for("+CUSD", LONG_TIMEOUT, &mut self.state).await?;
            if !waited.is_ok() {
                warn!("[{}] No USSD reply to {}", self.name(), code);
            }
        }
        Ok(self.state.last_ussd.take())
    }

    /// Reads, deletes, then reports a stored message. Undecodable messages are deleted and dropped.
    async fn fetch_sms(&mut self, index: u32) -> Result<(), AtError> {
        let text_mode = self.state.caps.sms_mode == SmsMode::Text;
        let ucs2 = text_mode && !self.state.caps.no_ucs2;
        if ucs2 {
            self.optional("AT+CSCS=\"UCS2\"").await?;
        }

        let read = format!("AT+CMGR={}", index);
        let reply = self.exchange(&read, None, true, LONG_TIMEOUT).await?;
        let decoded = match reply.require(&read) {
            Ok(reply) => decode_cmgr(&reply.lines, text_mode, ucs2),
            Err(e) => Err(SmsError::Malformed(e.to_string()))
        };

        let delete = format!("AT+CMGD={}", index);
        if !self.optional(&delete).await? {
            warn!("[{}] Could not delete message {}", self.name(), index);
        }

        match decoded {
            Ok(message) => {
                info!("[{}] Incoming SMS from {}", self.name(), message.sender);
                self.state.emit(Event::IncomingSms {
                    interface: self.name().to_string(),
                    message
                });
            },
            Err(e) => warn!("[{}] Dropping message {}: {}", self.name(), index, e)
        }
        Ok(())
    }

    async fn request_call_list(&mut self) -> Result<(), AtError> {
        self.optional("AT+CLCC").await?;
        Ok(())
    }

    /// Caller id from the received calls phonebook, for phones that never send RING.
    async fn poll_phonebook(&mut self) -> Result<(), AtError> {
        self.optional("AT+CPBS=RC").await?;

        let range = self.command("AT+CPBR=?").await?;
        let Some((first, last)) = range
            .find("+CPBR:")
            .and_then(|line| parsers::parse_cpbr_range(line).ok())
        else {
            warn!("[{}] Received calls phonebook is unavailable", self.name());
            return Ok(());
        };

        let first = first.max(last.saturating_sub(PHONEBOOK_MAX_ENTRIES - 1));
        let cmd = format!("AT+CPBR={},{}", first, last);
        let listing = self.exchange(&cmd, None, true, LONG_TIMEOUT).await?;
        let caller = listing.lines
            .iter()
            .filter(|line| line.starts_with("+CPBR:"))
            .filter_map(|line| parsers::parse_cpbr_entry(line).ok())
            .last();

        match caller {
            Some(caller) => {
                let actions = self.state.calls.apply(CallSignal::Phonebook(caller));
                self.state.perform(actions);
            },
            None => warn!("[{}] No entries in received calls phonebook", self.name())
        }
        Ok(())
    }

    async fn sync_status(&mut self) -> Result<(), AtError> {
        let config = Arc::clone(&self.config);
        self.optional("AT").await?;
        self.optional(&config.dialect.query_battery).await?;
        self.optional(&config.dialect.query_signal).await?;
        if self.state.caps.creg_supported {
            self.optional("AT+CREG?").await?;
        }
        Ok(())
    }

    pub fn status(&self) -> InterfaceStatus {
        self.state.status()
    }

    async fn drain_pending(&mut self) -> Result<(), SessionError> {
        while let Some(action) = self.state.pending.pop_front() {
            debug!("[{}] Running {:?}", self.name(), action);
            match action {
                PendingAction::FetchSms(index) => self.fetch_sms(index).await?,
                PendingAction::RequestCallList => self.request_call_list().await?,
                PendingAction::PollPhonebook => self.poll_phonebook().await?,
                PendingAction::ForceHangup(cause) => self.hangup_with(cause).await?
            }
        }
        Ok(())
    }

    async fn execute(&mut self, request: &InterfaceRequest) -> Result<InterfaceResponse, SessionError> {
        let response = match request {
            InterfaceRequest::Dial { number } => self.dial(number).await.map(|_| InterfaceResponse::Done),
            InterfaceRequest::Answer => self.answer().await.map(|_| InterfaceResponse::Done),
            InterfaceRequest::Hangup => self.hangup().await.map(|_| InterfaceResponse::Done),
            InterfaceRequest::SendDtmf { digit } => self.send_dtmf(*digit).await.map(|_| InterfaceResponse::Done),
            InterfaceRequest::SendSms { to, content } => self.send_sms(to, content).await
                .map(|references| InterfaceResponse::SmsSent { references }),
            InterfaceRequest::SendUssd { code } => self.send_ussd(code).await
                .map(|reply| InterfaceResponse::UssdSent { reply }),
            InterfaceRequest::GetStatus => Ok(InterfaceResponse::Status(self.status()))
        };

        // Work queued by lines that arrived during the request.
        if let Err(e) = self.drain_pending().await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("[{}] Queued work failed: {}", self.name(), e);
        }
        response
    }

    async fn handle_command(&mut self, mut command: OutgoingCommand) -> Result<(), SessionError> {
        debug!("[{}] Handling command #{}: {:?}", self.name(), command.sequence, command.request);

        let (response, fatal) = match self.execute(&command.request).await {
            Ok(response) => (response, None),
            Err(e) => {
                let response = InterfaceResponse::Error { message: e.to_string() };
                (response, e.is_fatal().then_some(e))
            }
        };

        // A failed respond() is already logged, the requester gave up waiting.
        let _ = command.respond(response);
        fatal.map_or(Ok(()), Err)
    }

    async fn idle_cycle(&mut self, last_sync: &mut Instant) -> Result<(), SessionError> {
        self.read_cycle(IDLE_READ).await?;

        let actions = self.state.calls.check_timers(Instant::now());
        self.state.perform(actions);
        self.drain_pending().await?;

        if last_sync.elapsed() >= self.sync_period {
            self.sync_status().await?;
            self.drain_pending().await?;
            *last_sync = Instant::now();
        }
        Ok(())
    }

    pub async fn run(&mut self, mut command_rx: mpsc::Receiver<OutgoingCommand>) {
        let mut last_sync = Instant::now();
        while self.is_running() {
            let result = match command_rx.try_recv() {
                Ok(command) => self.handle_command(command).await,
                Err(TryRecvError::Empty) => self.idle_cycle(&mut last_sync).await,
                Err(TryRecvError::Disconnected) => {
                    info!("[{}] Command channel closed, stopping", self.name());
                    break;
                }
            };

            match result {
                Err(e) if e.is_fatal() => {
                    self.link_lost(&e);
                    break;
                },
                Err(e) => warn!("[{}] {}", self.name(), e),
                Ok(()) => {}
            }
        }

        // Requests still queued get an answer instead of a dropped channel.
        command_rx.close();
        while let Ok(mut command) = command_rx.try_recv() {
            let _ = command.respond(InterfaceResponse::Error { message: SessionError::Stopped.to_string() });
        }
        self.channel.close().await;
        info!("[{}] Session stopped", self.name());
    }

    pub async fn initialize_and_run(mut self, command_rx: mpsc::Receiver<OutgoingCommand>) {
        if let Err(e) = self.initialize().await {
            error!("[{}] Initialization failed: {}", self.name(), e);
            self.state.alarm(Alarm::FailedInterface, format!("initialization failed: {}", e));
            self.running.store(false, Ordering::Relaxed);
            return;
        }
        self.run(command_rx).await;
    }

    fn link_lost(&mut self, e: &SessionError) {
        error!("[{}] Serial link lost: {}", self.name(), e);
        let actions = self.state.calls.link_lost();
        self.state.perform(actions);
        self.state.pending.clear();
        self.state.alarm(Alarm::FailedInterface, e.to_string());
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Decodes the line following `+CMGR:` in a read reply.
fn decode_cmgr(lines: &[String], text_mode: bool, ucs2: bool) -> Result<SmsMessage, SmsError> {
    let position = lines
        .iter()
        .position(|line| line.starts_with("+CMGR:"))
        .ok_or_else(|| SmsError::Malformed("no +CMGR header in reply".to_string()))?;

    let body = lines
        .get(position + 1)
        .filter(|line| line.as_str() != "OK")
        .ok_or_else(|| SmsError::Malformed("no message body after +CMGR".to_string()))?;

    if text_mode {
        sms::decode_text_mode(&lines[position], body, ucs2)
    } else {
        sms::decode(body)
    }
}
