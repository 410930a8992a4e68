// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Scripted backend for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::backend::{
    Backend, BackendError, BackendFuture, BackendId, BackendKind, Handle, PropertyKey,
    PropertyValue, Received,
};

use super::classify;

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub ids: Vec<BackendId>,
    pub enumerate_calls: usize,
    pub open_calls: usize,
    pub close_calls: usize,
    pub open_failure: Option<i32>,
    /// Codes returned by the next data calls, oldest first.
    pub failures: VecDeque<i32>,
    pub props: HashMap<PropertyKey, PropertyValue>,
    pub reads: Vec<PropertyKey>,
    pub writes: Vec<(PropertyKey, PropertyValue)>,
    pub sent: Vec<Vec<u8>>,
    /// Reply chunks per payload. Unlisted set-commands are acked with `1`,
    /// unlisted queries get no reply.
    pub replies: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    pending: VecDeque<Vec<u8>>,
    /// Sends issued while a previous reply was still being read.
    pub overlapping_sends: usize,
}

impl MockState {
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }
}

pub(crate) struct MockBackend {
    kind: BackendKind,
    next_handle: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> (Self, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                kind,
                next_handle: 1,
                state: state.clone(),
            },
            state,
        )
    }

    fn with_state<T>(&mut self, f: impl FnOnce(&mut MockState, BackendKind) -> Result<T, BackendError>) -> Result<T, BackendError> {
        let mut state = self.state.lock().unwrap();
        f(&mut state, self.kind)
    }
}

fn scripted_failure(state: &mut MockState) -> Result<(), BackendError> {
    match state.failures.pop_front() {
        Some(code) => Err(BackendError::new(code, "scripted failure")),
        None => Ok(()),
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn enumerate<'a>(&'a mut self) -> BackendFuture<'a, Vec<BackendId>> {
        let result = self.with_state(|s, _| {
            s.enumerate_calls += 1;
            Ok(s.ids.clone())
        });
        Box::pin(std::future::ready(result))
    }

    fn open<'a>(&'a mut self, id: &'a BackendId) -> BackendFuture<'a, Handle> {
        let handle = Handle(self.next_handle);
        self.next_handle += 1;
        let result = self.with_state(|s, kind| {
            s.open_calls += 1;
            if let Some(code) = s.open_failure.take() {
                return Err(BackendError::new(code, "open failed"));
            }
            if !s.ids.contains(id) {
                return Err(BackendError::new(classify::table(kind).invalid_id, "unknown id"));
            }
            s.pending.clear();
            Ok(handle)
        });
        Box::pin(std::future::ready(result))
    }

    fn close<'a>(&'a mut self, _handle: Handle) -> BackendFuture<'a, ()> {
        let result = self.with_state(|s, _| {
            s.close_calls += 1;
            Ok(())
        });
        Box::pin(std::future::ready(result))
    }

    fn send<'a>(&'a mut self, _handle: Handle, payload: &'a [u8]) -> BackendFuture<'a, ()> {
        let result = self.with_state(|s, _| {
            scripted_failure(s)?;
            if !s.pending.is_empty() {
                s.overlapping_sends += 1;
            }
            s.sent.push(payload.to_vec());
            let chunks = match s.replies.get(payload) {
                Some(chunks) => chunks.clone(),
                None if payload.starts_with(b":G") => Vec::new(),
                None => vec![b"1".to_vec()],
            };
            s.pending = chunks.into();
            Ok(())
        });
        Box::pin(std::future::ready(result))
    }

    fn receive<'a>(&'a mut self, _handle: Handle) -> BackendFuture<'a, Received> {
        let result = self.with_state(|s, _| {
            scripted_failure(s)?;
            Ok(match s.pending.pop_front() {
                Some(chunk) => Received::Bytes(chunk),
                None => Received::WouldBlock,
            })
        });
        Box::pin(std::future::ready(result))
    }

    fn read_property<'a>(
        &'a mut self,
        _handle: Handle,
        key: PropertyKey,
    ) -> BackendFuture<'a, PropertyValue> {
        let result = self.with_state(|s, kind| {
            scripted_failure(s)?;
            s.reads.push(key);
            s.props.get(&key).copied().ok_or_else(|| {
                BackendError::new(classify::table(kind).not_supported, format!("{:?}", key))
            })
        });
        Box::pin(std::future::ready(result))
    }

    fn write_property<'a>(
        &'a mut self,
        _handle: Handle,
        key: PropertyKey,
        value: PropertyValue,
    ) -> BackendFuture<'a, ()> {
        let result = self.with_state(|s, _| {
            scripted_failure(s)?;
            s.writes.push((key, value));
            match key {
                // Moves complete instantly.
                PropertyKey::Target => {
                    s.props.insert(PropertyKey::Position, value);
                }
                PropertyKey::Halt => {}
                _ => {
                    s.props.insert(key, value);
                }
            }
            Ok(())
        });
        Box::pin(std::future::ready(result))
    }
}
