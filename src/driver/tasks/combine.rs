//! Fixed-rate mixing of every speaker's audio into one combined stream.

use super::message::SinkSlot;
use crate::{audio::CombinedAudioFrame, constants::*, id::UserId};
use dashmap::DashMap;
use flume::{Receiver, Sender, TrySendError};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, instrument, trace};

struct QueuedFrame {
    received: Instant,
    pcm: Vec<i16>,
}

/// Bounded per-speaker queues of decoded audio, awaiting the mixer.
///
/// Each queue has one producer (the receive thread) and one consumer (the mixer).
pub struct SpeakerQueues {
    capacity: usize,
    queues: DashMap<UserId, (Sender<QueuedFrame>, Receiver<QueuedFrame>)>,
}

impl SpeakerQueues {
    /// Creates an empty set of queues, each holding up to `capacity` frames.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
        }
    }

    /// Queues a frame from `user`, received at `now`.
    ///
    /// Frames arriving at a full queue are dropped.
    pub fn push(&self, user: UserId, pcm: Vec<i16>, now: Instant) {
        let tx = self
            .queues
            .entry(user)
            .or_insert_with(|| flume::bounded(self.capacity))
            .0
            .clone();

        if let Err(TrySendError::Full(_)) = tx.try_send(QueuedFrame { received: now, pcm }) {
            trace!("Combined audio queue for {} is full, dropping frame.", user);
        }
    }

    /// Discards the queue belonging to `user`, along with any audio it holds.
    pub fn remove(&self, user: UserId) {
        if self.queues.remove(&user).is_some() {
            trace!("Dropped combined audio queue for {}.", user);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }

    /// Mixes one frame from every speaker with fresh audio.
    ///
    /// Frames older than `timeout` are discarded. A frame is produced even if
    /// nobody spoke, holding silence and no users.
    #[must_use]
    pub fn mix_tick(&self, now: Instant, timeout: Duration) -> CombinedAudioFrame {
        let mut mix = vec![0i32; STEREO_FRAME_SIZE];
        let mut users = vec![];

        for entry in self.queues.iter() {
            let rx = &entry.value().1;

            while let Ok(frame) = rx.try_recv() {
                if now.saturating_duration_since(frame.received) > timeout {
                    continue;
                }

                debug_assert_eq!(frame.pcm.len(), STEREO_FRAME_SIZE);
                if frame.pcm.len() != STEREO_FRAME_SIZE {
                    break;
                }

                for (acc, sample) in mix.iter_mut().zip(&frame.pcm) {
                    *acc += i32::from(*sample);
                }
                users.push(*entry.key());
                break;
            }
        }

        users.sort_unstable();

        CombinedAudioFrame {
            users,
            audio: mix
                .into_iter()
                .map(|s| s.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16)
                .collect(),
        }
    }
}

/// Starts and stops the combined-audio thread of one session.
pub(crate) struct Mixer {
    queues: Arc<SpeakerQueues>,
    sink: SinkSlot,
    timeout: Duration,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl Mixer {
    pub(crate) fn new(queues: Arc<SpeakerQueues>, sink: SinkSlot, timeout: Duration) -> Self {
        Self {
            queues,
            sink,
            timeout,
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the mixing thread if the sink wants combined audio and no
    /// thread is already running.
    pub(crate) fn ensure(&self) {
        if self.stop.load(Ordering::Acquire) || !wants_combined(&self.sink) {
            return;
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let state = MixerThread {
            queues: self.queues.clone(),
            sink: self.sink.clone(),
            timeout: self.timeout,
            running: self.running.clone(),
            stop: self.stop.clone(),
        };

        if let Err(e) = std::thread::Builder::new()
            .name("warble-combine".into())
            .spawn(move || runner(state))
        {
            error!("Failed to start combined audio thread: {:?}", e);
            self.running.store(false, Ordering::Release);
        }
    }

    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn wants_combined(sink: &SinkSlot) -> bool {
    sink.read()
        .as_ref()
        .map_or(false, |s| s.can_receive_combined())
}

struct MixerThread {
    queues: Arc<SpeakerQueues>,
    sink: SinkSlot,
    timeout: Duration,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

impl MixerThread {
    fn run(&self) {
        let mut deadline = Instant::now() + TIMESTEP_LENGTH;

        loop {
            spin_sleep::sleep(deadline.saturating_duration_since(Instant::now()));
            deadline += TIMESTEP_LENGTH;

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            let sink = self.sink.read().clone();
            let Some(sink) = sink.filter(|s| s.can_receive_combined()) else {
                break;
            };

            let now = Instant::now();
            if now > deadline + TIMESTEP_LENGTH * 5 {
                debug!("Mixer fell behind by {:?}.", now - deadline);
                deadline = now;
            }

            sink.on_combined_frame(&self.queues.mix_tick(now, self.timeout));
        }
    }

    /// Gives up the running flag, reclaiming it if a sink wanting combined
    /// audio arrived in the meantime.
    fn should_restart(&self) -> bool {
        self.running.store(false, Ordering::Release);

        !self.stop.load(Ordering::Acquire)
            && wants_combined(&self.sink)
            && self
                .running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

#[instrument(skip(state))]
fn runner(state: MixerThread) {
    trace!("Combined audio thread started.");

    loop {
        state.run();

        if !state.should_restart() {
            break;
        }
    }

    trace!("Combined audio thread stopped.");
}
