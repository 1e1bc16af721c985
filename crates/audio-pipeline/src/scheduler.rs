//! Cooperative per-track scheduler.
//!
//! Drives a linear chain of stages: calls the current stage, copies its output
//! into the next stage's [`Link`] and follows the returned [`Flow`]. Stages are
//! opened lazily on their first call and always closed in reverse order.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{Chunk, Link};
use crate::error::PipelineError;
use crate::format::PcmFormat;
use crate::stage::{Flow, Stage, StageContext, StageFactory};
use crate::track::{StopHandle, Track, TrackEvent};

/// Outcome of [`Scheduler::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// A stage is waiting; call [`Scheduler::wait`] then `run` again.
    Suspended,
    /// The chain completed and every stage is closed.
    Finished,
}

enum SlotState {
    Idle,
    Open(Box<dyn Stage>),
    Closed,
    Bypassed,
}

struct Slot {
    factory: Arc<dyn StageFactory>,
    state: SlotState,
    out_format: Option<PcmFormat>,
}

impl Slot {
    fn active(&self) -> bool {
        matches!(self.state, SlotState::Idle | SlotState::Open(_))
    }
}

enum Action {
    NeedMore,
    Next(usize),
    Again,
    Finish { last_output: bool },
    Bypass,
    Suspend,
}

pub struct Scheduler {
    track: Track,
    slots: Vec<Slot>,
    /// `links[i]` is the input of stage `i`.
    links: Vec<Link>,
    cur: usize,
    finished: bool,
    span: tracing::Span,
}

impl Scheduler {
    pub fn new(track: Track, chain: Vec<Arc<dyn StageFactory>>) -> Result<Self, PipelineError> {
        if chain.is_empty() {
            return Err(PipelineError::Config("empty stage chain".into()));
        }
        let span = tracing::info_span!("track", id = track.id(), input = ?track.input);
        let links = chain.iter().map(|_| Link::default()).collect();
        let slots = chain
            .into_iter()
            .map(|factory| Slot {
                factory,
                state: SlotState::Idle,
                out_format: None,
            })
            .collect();
        Ok(Self {
            track,
            slots,
            links,
            cur: 0,
            finished: false,
            span,
        })
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn track_mut(&mut self) -> &mut Track {
        &mut self.track
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.track.stop_handle()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Names of the stages in chain order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.factory.name()).collect()
    }

    /// Run until the chain finishes or a stage suspends.
    pub fn run(&mut self) -> Result<Progress, PipelineError> {
        if self.finished {
            return Ok(Progress::Finished);
        }
        let span = self.span.clone();
        let _enter = span.enter();

        while let Some(ev) = self.track.try_event() {
            self.apply_event(ev);
        }

        match self.drive() {
            Ok(Progress::Finished) => {
                self.close_all();
                self.finished = true;
                tracing::debug!(position = self.track.current_position, "track finished");
                Ok(Progress::Finished)
            }
            Ok(Progress::Suspended) => Ok(Progress::Suspended),
            Err(e) => {
                tracing::error!(stage = self.slots[self.cur].factory.name(), "{e}");
                self.close_all();
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Block until the track is woken. Returns `false` on timeout.
    pub fn wait(&mut self, timeout: Option<Duration>) -> bool {
        match self.track.wait_event(timeout) {
            Some(ev) => {
                self.apply_event(ev);
                true
            }
            None => false,
        }
    }

    /// Run to completion, sleeping while suspended.
    pub fn run_blocking(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.run()? {
                Progress::Finished => return Ok(()),
                Progress::Suspended => {
                    self.wait(None);
                }
            }
        }
    }

    fn apply_event(&mut self, ev: TrackEvent) {
        match ev {
            TrackEvent::Resume => {}
            TrackEvent::Stop => self.track.request_stop(),
            TrackEvent::Seek(pos) => {
                tracing::debug!(?pos, "seek requested");
                self.track.seek_request = Some(pos);
                let Some(first) = self.first_active() else {
                    return;
                };
                for link in &mut self.links[first + 1..] {
                    link.clear();
                }
                self.cur = first;
            }
        }
    }

    fn first_active(&self) -> Option<usize> {
        self.slots.iter().position(Slot::active)
    }

    fn ensure_open(&mut self, i: usize) -> Result<(), PipelineError> {
        if let SlotState::Idle = self.slots[i].state {
            let stage = self.slots[i].factory.open(&mut self.track)?;
            tracing::debug!(stage = self.slots[i].factory.name(), "opened");
            self.slots[i].state = SlotState::Open(stage);
        }
        Ok(())
    }

    fn drive(&mut self) -> Result<Progress, PipelineError> {
        loop {
            let i = self.cur;
            self.ensure_open(i)?;

            let next = (i + 1..self.slots.len()).find(|&j| self.slots[j].active());
            let prev = (0..i).rev().find(|&j| self.slots[j].active());
            let first = self.first_active().unwrap_or(i);
            let had_seek = self.track.seek_request.is_some();
            let had_input_seek = self.track.input_seek.is_some();
            let name = self.slots[i].factory.name();

            let Self {
                track,
                slots,
                links,
                ..
            } = self;
            let slot = &mut slots[i];
            let SlotState::Open(stage) = &mut slot.state else {
                return Err(PipelineError::protocol(name, "stage is not open"));
            };

            let in_format = links[i].format;
            let mut cx = StageContext::new(track, links[i].input(), i);
            let flow = stage.process(&mut cx);
            let consumed = cx.input.consumed();
            if let Some(f) = cx.output_format() {
                slot.out_format = Some(f);
            }
            let flow = flow?;
            let out_format = slot.out_format.or(in_format);

            links[i].consume(consumed);
            links[i].reset = false;
            tracing::trace!(stage = name, flow = flow.name(), consumed, "process");

            // A consumed seek invalidates everything buffered downstream.
            if had_seek && track.seek_request.is_none() {
                for link in &mut links[i + 1..] {
                    link.clear();
                    link.reset = true;
                }
            }
            // The source is about to jump; bytes staged for the requester are stale.
            if !had_input_seek && track.input_seek.is_some() && first < i {
                for link in &mut links[first + 1..=i] {
                    link.clear();
                }
            }

            let action = match flow {
                Flow::NeedMore => Action::NeedMore,
                Flow::Data(chunk) => match next {
                    Some(n) => {
                        stage_output(&mut links[n], chunk, out_format)?;
                        Action::Next(n)
                    }
                    None => Action::Again,
                },
                Flow::Done(chunk) => {
                    if let Some(n) = next {
                        stage_output(&mut links[n], chunk, out_format)?;
                        links[n].last = true;
                    }
                    Action::Finish { last_output: false }
                }
                Flow::LastOutput(chunk) => {
                    if let Some(n) = next {
                        stage_output(&mut links[n], chunk, out_format)?;
                        links[n].last = true;
                    }
                    Action::Finish { last_output: true }
                }
                Flow::DonePrevious => Action::Bypass,
                Flow::Pending => Action::Suspend,
            };

            match action {
                Action::NeedMore => {
                    if self.links[i].last {
                        tracing::warn!(stage = name, "stage asked for input after end of stream");
                        self.close_through(i);
                        match next {
                            Some(n) => self.cur = n,
                            None => return Ok(Progress::Finished),
                        }
                        continue;
                    }
                    match prev {
                        Some(p) => self.cur = p,
                        None => {
                            return Err(PipelineError::protocol(
                                name,
                                "first stage of the chain asked for input",
                            ));
                        }
                    }
                }
                Action::Next(n) => self.cur = n,
                Action::Again => {}
                Action::Finish { last_output } => {
                    if last_output {
                        tracing::debug!(stage = name, "last output, stopping upstream");
                    }
                    self.close_through(i);
                    match next {
                        Some(n) => self.cur = n,
                        None => return Ok(Progress::Finished),
                    }
                }
                Action::Bypass => {
                    tracing::debug!(stage = name, "bypassed");
                    self.close_slot(i, SlotState::Bypassed);
                    match next {
                        Some(n) => {
                            let (head, tail) = self.links.split_at_mut(n);
                            tail[0].take_from(&mut head[i])?;
                            self.cur = n;
                        }
                        None => return Ok(Progress::Finished),
                    }
                }
                Action::Suspend => return Ok(Progress::Suspended),
            }
        }
    }

    fn close_slot(&mut self, i: usize, end: SlotState) {
        let state = std::mem::replace(&mut self.slots[i].state, end);
        match state {
            SlotState::Open(mut stage) => {
                stage.close(&mut self.track);
                tracing::debug!(stage = self.slots[i].factory.name(), "closed");
            }
            SlotState::Bypassed => self.slots[i].state = SlotState::Bypassed,
            SlotState::Idle | SlotState::Closed => {}
        }
    }

    /// Close stage `i` and everything upstream of it.
    fn close_through(&mut self, i: usize) {
        for j in (0..=i).rev() {
            self.close_slot(j, SlotState::Closed);
        }
    }

    fn close_all(&mut self) {
        if let Some(last) = self.slots.len().checked_sub(1) {
            self.close_through(last);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn stage_output(
    link: &mut Link,
    chunk: Chunk<'_>,
    format: Option<PcmFormat>,
) -> Result<(), PipelineError> {
    if format.is_some() {
        link.format = format;
    }
    link.append(chunk)
}
