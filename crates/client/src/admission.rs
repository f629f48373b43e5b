//! Send admission control.
//!
//! Every `send` is admitted immediately and gets a sequence number. At most
//! `max_inflight` at-least-once messages are on the wire at any time; the
//! rest wait in FIFO order. Once the number of outstanding at-least-once
//! messages reaches the limit, `send` answers `false` and the caller should
//! pause until the drain notification.
//!
//! Completions of at-least-once messages are released per topic in
//! admission order: an acknowledgement that overtakes an earlier message on
//! the same topic is held until that message completes.

use std::{
    collections::{BTreeMap, VecDeque},
    mem,
};

use tracing::{debug, trace};

use crate::{
    client::Inner,
    connection::WireOp,
    dispatcher::SendCallback,
    error::{ClientError, Result},
    message::{Payload, Qos, SendOptions, SentMessage},
    transport::WireMessage,
    validate,
};

#[derive(Debug)]
enum Status {
    Queued,
    InFlight,
    Done(Result<()>),
}

struct Outbound {
    message: SentMessage,
    callback: Option<SendCallback>,
    status: Status,
}

impl Outbound {
    fn tracked(&self) -> bool {
        self.message.qos == Qos::AtLeastOnce
    }

    fn wire(&self) -> WireMessage {
        WireMessage {
            topic: self.message.topic.clone(),
            payload: self.message.payload.clone(),
            qos: self.message.qos,
            ttl: self.message.ttl,
        }
    }
}

/// A send whose completion callback is due.
pub(crate) struct Completion {
    callback: Option<SendCallback>,
    message: SentMessage,
    result: Result<()>,
}

/// Outcome of admitting a message.
#[derive(Debug)]
pub(crate) struct Admitted {
    pub(crate) seq: u64,

    /// `false` once the admission limit is reached.
    pub(crate) may_continue: bool,

    /// Messages that may go on the wire now.
    pub(crate) dispatch: Vec<(u64, WireMessage)>,
}

/// Outcome of a completion or of failing everything.
#[derive(Default)]
pub(crate) struct Released {
    pub(crate) completions: Vec<Completion>,
    pub(crate) dispatch: Vec<(u64, WireMessage)>,

    /// The limit was reached earlier and sends are admitted again.
    pub(crate) drained: bool,
}

pub(crate) struct Admission {
    limit: usize,
    next_seq: u64,
    entries: BTreeMap<u64, Outbound>,
    queued: VecDeque<u64>,

    /// At-least-once messages admitted and not yet completed.
    outstanding: usize,

    /// At-least-once messages handed to the wire and not yet completed.
    on_wire: usize,
    blocked: bool,
}

impl Admission {
    pub(crate) fn new(limit: usize) -> Self {
        Admission {
            limit: limit.max(1),
            next_seq: 0,
            entries: BTreeMap::new(),
            queued: VecDeque::new(),
            outstanding: 0,
            on_wire: 0,
            blocked: false,
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub(crate) fn admit(&mut self, message: SentMessage, callback: Option<SendCallback>) -> Admitted {
        self.next_seq += 1;
        let seq = self.next_seq;
        let entry = Outbound {
            message,
            callback,
            status: Status::Queued,
        };
        if entry.tracked() {
            self.outstanding += 1;
        }
        self.entries.insert(seq, entry);
        self.queued.push_back(seq);

        let dispatch = self.promote();
        let may_continue = self.outstanding < self.limit;
        if !may_continue {
            self.blocked = true;
        }
        Admitted {
            seq,
            may_continue,
            dispatch,
        }
    }

    /// Moves queued messages onto the wire while slots are free.
    fn promote(&mut self) -> Vec<(u64, WireMessage)> {
        let mut dispatch = Vec::new();
        while let Some(&seq) = self.queued.front() {
            let Some(entry) = self.entries.get_mut(&seq) else {
                self.queued.pop_front();
                continue;
            };
            if entry.tracked() {
                if self.on_wire >= self.limit {
                    break;
                }
                self.on_wire += 1;
            }
            entry.status = Status::InFlight;
            dispatch.push((seq, entry.wire()));
            self.queued.pop_front();
        }
        dispatch
    }

    /// Records the wire result of one message.
    ///
    /// Unknown sequence numbers and repeated results are ignored, so a
    /// completion can never fire twice.
    pub(crate) fn complete(&mut self, seq: u64, result: Result<()>) -> Released {
        let (topic, tracked) = match self.entries.get_mut(&seq) {
            Some(entry) if matches!(entry.status, Status::InFlight) => {
                entry.status = Status::Done(result);
                (entry.message.topic.clone(), entry.tracked())
            }
            _ => return Released::default(),
        };

        let ready: Vec<u64> = if tracked {
            self.entries
                .iter()
                .filter(|(_, entry)| entry.tracked() && entry.message.topic == topic)
                .take_while(|(_, entry)| matches!(entry.status, Status::Done(_)))
                .map(|(seq, _)| *seq)
                .collect()
        } else {
            vec![seq]
        };
        if tracked && ready.is_empty() {
            trace!("Acknowledgement of {} held behind an earlier send on '{}'", seq, topic);
        }

        let completions = ready
            .into_iter()
            .filter_map(|seq| self.release(seq))
            .collect();
        Released {
            completions,
            dispatch: self.promote(),
            drained: self.check_drained(),
        }
    }

    fn release(&mut self, seq: u64) -> Option<Completion> {
        let entry = self.entries.remove(&seq)?;
        if entry.tracked() {
            self.outstanding = self.outstanding.saturating_sub(1);
            if !matches!(entry.status, Status::Queued) {
                self.on_wire = self.on_wire.saturating_sub(1);
            }
        }
        let result = match entry.status {
            Status::Done(result) => result,
            Status::Queued | Status::InFlight => Ok(()),
        };
        Some(Completion {
            callback: entry.callback,
            message: entry.message,
            result,
        })
    }

    /// Fails every admitted message that has not completed yet.
    ///
    /// Messages already acknowledged but held for ordering keep their own
    /// result.
    pub(crate) fn fail_all(&mut self, err: &ClientError) -> Released {
        let completions = mem::take(&mut self.entries)
            .into_values()
            .map(|entry| Completion {
                result: match entry.status {
                    Status::Done(result) => result,
                    Status::Queued | Status::InFlight => Err(err.clone()),
                },
                callback: entry.callback,
                message: entry.message,
            })
            .collect();
        self.queued.clear();
        self.outstanding = 0;
        self.on_wire = 0;
        Released {
            completions,
            dispatch: Vec::new(),
            drained: self.check_drained(),
        }
    }

    fn check_drained(&mut self) -> bool {
        if self.blocked && self.outstanding < self.limit {
            self.blocked = false;
            true
        } else {
            false
        }
    }
}

impl Inner {
    pub(crate) fn send(
        &self,
        topic: &str,
        payload: Payload,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<bool> {
        validate::topic(topic)?;
        let ttl = options.ttl.map(validate::ttl).transpose()?;

        let mut guard = self.core();
        let core = &mut *guard;
        core.ensure_started()?;

        let message = SentMessage {
            topic: topic.to_string(),
            payload,
            qos: options.qos,
            ttl,
        };
        let admitted = core.admission.admit(message, callback);
        trace!(client_id = %self.id, "Admitted send {} to '{}' ({})", admitted.seq, topic, options.qos);
        for (seq, message) in admitted.dispatch {
            core.submit(WireOp::Send { seq, message });
        }
        if !admitted.may_continue {
            debug!(
                client_id = %self.id,
                "Admission limit reached with {} sends outstanding",
                core.admission.outstanding()
            );
        }
        Ok(admitted.may_continue)
    }

    /// Wire result of one send.
    pub(crate) fn complete_send(&self, generation: u64, seq: u64, result: Result<()>) {
        let mut guard = self.core();
        let core = &mut *guard;
        if !core.is_live(generation) {
            return;
        }
        let mut released = core.admission.complete(seq, result);
        for (seq, message) in mem::take(&mut released.dispatch) {
            core.submit(WireOp::Send { seq, message });
        }
        self.finish_sends(released);
    }

    /// Posts send completions and the drain notification.
    pub(crate) fn finish_sends(&self, released: Released) {
        for Completion {
            callback,
            message,
            result,
        } in released.completions
        {
            if let Err(err) = &result {
                debug!(client_id = %self.id, "Send to '{}' failed: {}", message.topic, err);
            }
            if let Some(callback) = callback {
                self.dispatcher
                    .post("send", move |client| callback(client, result, &message));
            }
        }

        if released.drained {
            debug!(client_id = %self.id, "Send backlog drained");
            if let Some(hook) = self.hooks.on_drain.clone() {
                self.dispatcher.post("drain", move |client| hook(client));
            }
            self.drain.notify_waiters();
        }
    }

    /// Resolves once sends are admitted without backpressure.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let blocked = self.core().admission.is_blocked();
            if !blocked {
                return;
            }
            notified.await;
        }
    }
}
