//! Cooperative background work.
//!
//! Long operations are split into steps; [`Rafs::step`] runs exactly one of
//! them, so at most one erase or table rewrite happens per tick.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::compact::{self, CompactState};
use crate::dirent::{Extent, MAX_DIR_ENTRIES};
use crate::file::FileId;
use crate::filesystem::Rafs;
use crate::partition::{Partition, PartitionManager};
use crate::{RafsError, Result};

/// Where completion messages are delivered.
pub type Responder = mpsc::UnboundedSender<RafsMessage>;

#[derive(Debug, Clone, PartialEq)]
pub struct WriteComplete {
    pub result: Result<()>,
    pub file: FileId,
    /// The buffer handed to the background write, returned to the caller.
    pub data: Bytes,
    pub requested: u32,
    pub written: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RafsMessage {
    MountComplete { status: Result<()> },
    CompactComplete { status: Result<()>, free_slots: u32 },
    WriteComplete(WriteComplete),
    RemoveComplete { status: Result<()> },
}

pub(crate) fn notify(responder: Option<&Responder>, message: RafsMessage) {
    match responder {
        Some(tx) => {
            if tx.send(message).is_err() {
                debug!("Completion receiver dropped");
            }
        }
        None => debug!("No responder for {:?}", message),
    }
}

#[derive(Debug)]
pub(crate) enum CompactOrigin {
    Caller(Option<Responder>),
    IdleTimer,
}

#[derive(Debug)]
pub(crate) enum Work {
    Mount {
        responder: Option<Responder>,
        next_block: u32,
    },
    Compact {
        origin: CompactOrigin,
        state: CompactState,
        status: Result<()>,
    },
    Write {
        file: FileId,
        data: Bytes,
    },
    Remove {
        responder: Option<Responder>,
        extents: Vec<Extent>,
    },
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum IdleTimer {
    #[default]
    Unarmed,
    Armed(Instant),
    Fired,
    AwaitingCompaction,
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queue: VecDeque<Work>,
    pub(crate) idle: IdleTimer,
}

impl Scheduler {
    pub(crate) fn push(&mut self, work: Work) {
        self.queue.push_back(work);
    }

    fn pop(&mut self) -> Option<Work> {
        self.queue.pop_front()
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
        // A dropped IdleTimeout or idle compaction would leave the timer stuck.
        if matches!(self.idle, IdleTimer::Fired | IdleTimer::AwaitingCompaction) {
            self.idle = IdleTimer::Unarmed;
        }
    }

    /// Arm the idle timer or queue its expiry. A zero period disables it.
    pub(crate) fn poll_idle(&mut self, now: Instant, period: Duration) {
        if period.is_zero() {
            return;
        }
        match self.idle {
            IdleTimer::Unarmed => self.idle = IdleTimer::Armed(now + period),
            IdleTimer::Armed(deadline) if now >= deadline => {
                self.idle = IdleTimer::Fired;
                self.push(Work::IdleTimeout);
            }
            _ => {}
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match self.idle {
            IdleTimer::Armed(deadline) => Some(deadline),
            _ => None,
        }
    }
}

impl<M: PartitionManager> Rafs<M> {
    /// Run one queued step. Returns `false` when nothing was queued.
    pub fn step(&mut self) -> bool {
        match self.scheduler.pop() {
            Some(work) => {
                self.process(work);
                true
            }
            None => false,
        }
    }

    /// Run steps until the queue is empty.
    pub fn run_until_idle(&mut self) {
        while self.step() {}
    }

    pub fn pending_work(&self) -> usize {
        self.scheduler.pending()
    }

    /// Advance the idle-maintenance timer to `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        let period = self.config.idle_period();
        self.scheduler.poll_idle(now, period);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    fn process(&mut self, work: Work) {
        match work {
            Work::Mount { responder, next_block } => self.mount_step(responder, next_block),
            Work::Compact { origin, state, status } => self.compact_step(origin, state, status),
            Work::Write { file, data } => self.write_step(file, data),
            Work::Remove { responder, extents } => self.remove_step(responder, extents),
            Work::IdleTimeout => self.idle_timeout(),
        }
    }

    fn mount_step(&mut self, responder: Option<Responder>, next_block: u32) {
        let cleaned = self
            .volume
            .as_mut()
            .and_then(|volume| volume.clean_next_block(next_block));
        match cleaned {
            Some(block) => self.scheduler.push(Work::Mount {
                responder,
                next_block: block + 1,
            }),
            None => {
                info!("Mount complete");
                self.busy = false;
                notify(responder.as_ref(), RafsMessage::MountComplete { status: Ok(()) });
            }
        }
    }

    fn compact_step(&mut self, origin: CompactOrigin, state: CompactState, status: Result<()>) {
        let Some(volume) = self.volume.as_mut() else {
            self.busy = false;
            return;
        };

        if state == CompactState::Complete {
            let free_slots = match status {
                Ok(()) => (MAX_DIR_ENTRIES - volume.free_dir_slot) as u32,
                Err(_) => 0,
            };
            info!("Compaction complete: {:?}, {} free slots", status, free_slots);
            self.busy = false;
            match origin {
                CompactOrigin::Caller(responder) => notify(
                    responder.as_ref(),
                    RafsMessage::CompactComplete { status, free_slots },
                ),
                CompactOrigin::IdleTimer => self.scheduler.idle = IdleTimer::Unarmed,
            }
            return;
        }

        let limit = volume.free_dir_slot;
        let outcome = compact::run_step(&mut volume.fat(), state, limit);
        let next = match outcome {
            Ok(packed) => {
                if let Some(packed) = packed {
                    volume.sequence_number = packed.files;
                    volume.free_dir_slot = packed.free_dir_slot;
                }
                Work::Compact { origin, state: state.next(), status }
            }
            Err(e) => {
                error!("Compaction step {:?} failed: {}", state, e);
                Work::Compact {
                    origin,
                    state: CompactState::Complete,
                    status: Err(RafsError::FatWriteFailed),
                }
            }
        };
        self.scheduler.push(next);
    }

    fn write_step(&mut self, file: FileId, data: Bytes) {
        let requested = data.len() as u32;
        let (written, result, responder) = match self.ready_volume() {
            Ok(volume) => {
                let (written, result) = volume.write_some(file, &data);
                let responder = volume.files.get(file).ok().and_then(|f| f.responder.clone());
                (written, result, responder)
            }
            Err(e) => (0, Err(e), None),
        };
        if responder.is_none() {
            warn!("Background write to {} finished without a responder", file);
        }
        notify(
            responder.as_ref(),
            RafsMessage::WriteComplete(WriteComplete {
                result,
                file,
                data,
                requested,
                written: written as u32,
            }),
        );
    }

    fn remove_step(&mut self, responder: Option<Responder>, mut extents: Vec<Extent>) {
        let Some(last) = extents.last_mut() else {
            self.busy = false;
            notify(responder.as_ref(), RafsMessage::RemoveComplete { status: Ok(()) });
            return;
        };

        if last.length > 0 {
            if let Some(volume) = self.volume.as_mut() {
                let offset = u32::from(last.offset) * volume.info.block_size;
                if let Err(e) = volume.partition.erase_background(offset) {
                    warn!("Erasing removed block {} failed: {}", last.offset, e);
                }
            }
            last.offset = last.offset.wrapping_add(1);
            last.length -= 1;
        }
        if last.length == 0 {
            extents.pop();
        }
        self.scheduler.push(Work::Remove { responder, extents });
    }

    fn idle_timeout(&mut self) {
        let idle = match (self.volume.as_ref(), self.idle_callback.as_mut()) {
            (Some(_), Some(is_idle)) => is_idle(),
            _ => false,
        };
        let path = self.volume.as_ref().map(|v| format!("/{}", v.name));

        let started = match path {
            Some(path) if idle => match self.begin_compaction(&path, CompactOrigin::IdleTimer) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Idle compaction not started: {}", e);
                    false
                }
            },
            _ => false,
        };
        self.scheduler.idle = if started {
            IdleTimer::AwaitingCompaction
        } else {
            IdleTimer::Unarmed
        };
    }
}
