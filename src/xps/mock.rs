//! Scripted in-memory controller for exercising the flyer without hardware.
//!
//! Replies are keyed by API name (the text before the opening parenthesis).
//! One-shot replies are consumed before the standing reply; commands with
//! no script answer `0,EndOfAPI`.

use super::client::Transport;
use crate::error::FlyError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    standing: HashMap<String, String>,
    queued: HashMap<String, VecDeque<String>>,
    delays: HashMap<String, Duration>,
    transport_failures: HashMap<String, usize>,
    requests: Vec<String>,
}

/// Shared handle to a scripted controller.
#[derive(Clone, Default)]
pub struct MockController {
    script: Arc<Mutex<Script>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every `command` call with `reply` (a full `status,...,EndOfAPI` line).
    pub fn reply(&self, command: &str, reply: &str) -> &Self {
        self.script
            .lock()
            .standing
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Answer the next `command` call with `reply`.
    pub fn reply_once(&self, command: &str, reply: &str) -> &Self {
        self.script
            .lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_string());
        self
    }

    /// Hold every `command` reply back for `delay`.
    pub fn delay(&self, command: &str, delay: Duration) -> &Self {
        self.script
            .lock()
            .delays
            .insert(command.to_string(), delay);
        self
    }

    /// Fail the next `times` calls of `command` with a socket timeout.
    pub fn fail_transport(&self, command: &str, times: usize) -> &Self {
        self.script
            .lock()
            .transport_failures
            .insert(command.to_string(), times);
        self
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.script.lock().requests.clone()
    }

    /// How many times `command` was issued.
    pub fn count(&self, command: &str) -> usize {
        self.script
            .lock()
            .requests
            .iter()
            .filter(|r| api_name(r) == command)
            .count()
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            script: Arc::clone(&self.script),
        })
    }
}

fn api_name(request: &str) -> &str {
    request.split('(').next().unwrap_or(request)
}

struct MockTransport {
    script: Arc<Mutex<Script>>,
}

impl Transport for MockTransport {
    fn exchange(&mut self, request: &str) -> Result<String, FlyError> {
        let name = api_name(request).to_string();

        let (reply, delay) = {
            let mut script = self.script.lock();
            script.requests.push(request.to_string());

            if let Some(left) = script.transport_failures.get_mut(&name) {
                if *left > 0 {
                    *left -= 1;
                    return Err(FlyError::Timeout);
                }
            }

            let queued = script.queued.get_mut(&name).and_then(VecDeque::pop_front);
            let reply = queued
                .or_else(|| script.standing.get(&name).cloned())
                .unwrap_or_else(|| "0,EndOfAPI".to_string());
            (reply, script.delays.get(&name).copied())
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(reply)
    }
}
