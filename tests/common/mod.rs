//! Scripted charger shared by the integration tests

#![allow(dead_code)]

use isdt_lib::capability::{CapabilityMatrix, Mode, Model};
use isdt_lib::codec::{CodecConfig, Direction, Frame, Reassembler, Report};
use isdt_lib::exchange::Transport;
use isdt_lib::session::{Identity, Session, SessionConfig};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct Inner {
    inbox: VecDeque<Report>,
    answers: VecDeque<Vec<Report>>,
    reassembler: Reassembler,
    requests: Vec<Frame>,
    writes: usize,
    // an answer was released and not yet read completely
    outstanding: bool,
    overlaps: usize,
}

/// Fake charger that releases one scripted answer per complete request.
///
/// Clones share their state, so a test keeps one handle while the session owns another.
#[derive(Debug, Clone)]
pub struct MockCharger {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockCharger {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                inbox: VecDeque::new(),
                answers: VecDeque::new(),
                reassembler: Reassembler::new(CodecConfig::APPLICATION),
                requests: Vec::new(),
                writes: 0,
                outstanding: false,
                overlaps: 0,
            })),
        }
    }
}

impl MockCharger {
    /// Answers the next request with a standard frame.
    pub fn reply(&self, opcode: u8, payload: &[u8]) -> &Self {
        self.reply_reports(response(opcode, payload))
    }

    pub fn reply_reports(&self, reports: Vec<Report>) -> &Self {
        self.inner.lock().unwrap().answers.push_back(reports);
        self
    }

    /// Leaves the next request unanswered.
    pub fn ignore(&self) -> &Self {
        self.reply_reports(Vec::new())
    }

    /// Reports already waiting before the next request is written.
    pub fn stale(&self, reports: Vec<Report>) -> &Self {
        self.inner.lock().unwrap().inbox.extend(reports);
        self
    }

    pub fn requests(&self) -> Vec<Frame> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.requests().iter().map(|frame| frame.opcode).collect()
    }

    pub fn writes(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    pub fn pending_reports(&self) -> usize {
        self.inner.lock().unwrap().inbox.len()
    }

    /// Requests that started while an earlier answer was still unread.
    pub fn overlaps(&self) -> usize {
        self.inner.lock().unwrap().overlaps
    }
}

impl Transport for MockCharger {
    fn write_report(&mut self, report: &Report) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reassembler.is_empty() && inner.outstanding {
            inner.overlaps += 1;
        }
        inner.writes += 1;
        let complete = inner
            .reassembler
            .push(&report[..])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if let Some(frame) = complete {
            assert_eq!(frame.direction, Direction::HostToCharger);
            inner.requests.push(frame);
            inner.reassembler = Reassembler::new(CodecConfig::APPLICATION);
            if let Some(answer) = inner.answers.pop_front() {
                inner.outstanding = !answer.is_empty();
                inner.inbox.extend(answer);
            }
        }
        Ok(())
    }

    fn read_report(&mut self, _timeout: Duration) -> io::Result<Option<Report>> {
        std::thread::yield_now();
        let mut inner = self.inner.lock().unwrap();
        let report = inner.inbox.pop_front();
        if inner.inbox.is_empty() {
            inner.outstanding = false;
        }
        Ok(report)
    }
}

pub fn response(opcode: u8, payload: &[u8]) -> Vec<Report> {
    Frame::response(opcode, payload)
        .encode(&CodecConfig::APPLICATION)
        .unwrap()
}

/// Single report answer without sync byte, escaping or checksum.
pub fn raw_report(body: &[u8]) -> Vec<Report> {
    let mut bytes = vec![0x02, body.len() as u8];
    bytes.extend_from_slice(body);
    vec![Report::from_slice(&bytes)]
}

pub fn identity(model: Model, mode: Mode) -> Identity {
    Identity {
        model,
        mode,
        model_name: Some(model.to_string()),
    }
}

pub fn session(mock: &MockCharger) -> Session<MockCharger> {
    let config = SessionConfig {
        timeout: Duration::from_millis(10),
        ..Default::default()
    };
    Session::with_config(mock.clone(), Arc::new(CapabilityMatrix::standard()), config)
}

/// Session that already knows what it talks to.
pub fn session_as(mock: &MockCharger, model: Model, mode: Mode) -> Session<MockCharger> {
    let session = session(mock);
    session.assume_identity(identity(model, mode));
    session
}

/// Link test answer carrying a model name.
pub fn named_link_test(mode: Mode, name: &str) -> Vec<u8> {
    let mut payload = vec![u8::from(mode == Mode::App)];
    let mut name = name.as_bytes().to_vec();
    name.resize(8, 0);
    payload.extend_from_slice(&name);
    payload
}

pub fn version_payload(name: &str) -> Vec<u8> {
    let mut payload = vec![0; 8];
    payload.extend_from_slice(&[1, 2, 0, 0, 1, 0, 0, 1, 1, 0, 0, 17]);
    let mut name = name.as_bytes().to_vec();
    name.resize(10, 0);
    payload.extend_from_slice(&name);
    payload
}

/// Charging metrics of `channel`, 4.1 V at 1 A.
pub fn metrics_payload(channel: u8) -> Vec<u8> {
    let mut payload = vec![channel, 3, 2, 2, 25, 30, 42];
    payload.extend_from_slice(&4100i16.to_le_bytes());
    payload.extend_from_slice(&1000i16.to_le_bytes());
    payload.extend_from_slice(&55u16.to_le_bytes());
    payload.extend_from_slice(&4100i16.to_le_bytes());
    payload.extend_from_slice(&1200i16.to_le_bytes());
    payload.extend_from_slice(&900i32.to_le_bytes());
    payload.extend_from_slice(&3600u32.to_le_bytes());
    payload
}
