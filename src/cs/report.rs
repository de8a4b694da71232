//! Result events reported to the host.

use super::step::StepResult;
use super::SessionId;
use crate::Error;

/// Maximum number of step results carried by a single event.
pub const MAX_STEPS_PER_EVENT: usize = 9;

/// Completion status of a subevent or procedure, as reported with step results.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DoneStatus {
    /// All results have been reported.
    Complete,
    /// More results follow in later events.
    Partial,
    /// The subevent or procedure was aborted.
    Aborted,
}

impl DoneStatus {
    pub fn raw(self) -> u8 {
        match self {
            DoneStatus::Complete => 0x0,
            DoneStatus::Partial => 0x1,
            DoneStatus::Aborted => 0xf,
        }
    }
}

/// An event reported to the host.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CsEvent<'a> {
    /// First results of a subevent.
    SubeventResult {
        session: SessionId,
        config_id: u8,
        /// Connection event counter at the start of the procedure.
        start_event_counter: u16,
        procedure_counter: u16,
        procedure_done: DoneStatus,
        subevent_done: DoneStatus,
        results: &'a [StepResult],
    },
    /// Further results of the subevent reported by the last `SubeventResult`.
    SubeventResultContinue {
        session: SessionId,
        config_id: u8,
        procedure_done: DoneStatus,
        subevent_done: DoneStatus,
        results: &'a [StepResult],
    },
    /// Procedures of a configuration have been disabled, either on request or due to an error.
    ProcedureDisabled {
        session: SessionId,
        config_id: u8,
        status: Result<(), Error>,
    },
    /// A test procedure has ended.
    TestEnded,
}

/// The host side of the controller.
pub trait Host {
    /// Called for every event the controller reports.
    ///
    /// This is invoked synchronously from the controller's callbacks and must not block.
    fn on_event(&mut self, event: CsEvent<'_>);
}

impl<H: Host + ?Sized> Host for &'_ mut H {
    fn on_event(&mut self, event: CsEvent<'_>) {
        (**self).on_event(event)
    }
}

/// Fields shared by all result events of a subevent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResultHeader {
    pub session: SessionId,
    pub config_id: u8,
    pub start_event_counter: u16,
    pub procedure_counter: u16,
}

/// Reports `results` to `host`, split into events of at most [`MAX_STEPS_PER_EVENT`] results.
///
/// The first event is a `SubeventResult` unless `continuation` is set. All events but the last
/// carry `Partial` done statuses. An empty `results` slice still produces one event, so that
/// completion is always signalled.
///
/// Returns the number of events sent.
///
/// [`MAX_STEPS_PER_EVENT`]: constant.MAX_STEPS_PER_EVENT.html
pub fn report_results<H: Host + ?Sized>(
    host: &mut H,
    header: &ResultHeader,
    mut continuation: bool,
    results: &[StepResult],
    subevent_done: DoneStatus,
    procedure_done: DoneStatus,
) -> usize {
    let chunks = (results.len() + MAX_STEPS_PER_EVENT - 1) / MAX_STEPS_PER_EVENT;
    let chunks = chunks.max(1);
    for index in 0..chunks {
        let start = index * MAX_STEPS_PER_EVENT;
        let end = (start + MAX_STEPS_PER_EVENT).min(results.len());
        let chunk = &results[start.min(end)..end];
        let (subevent, procedure) = if index + 1 == chunks {
            (subevent_done, procedure_done)
        } else {
            (DoneStatus::Partial, DoneStatus::Partial)
        };

        let event = if continuation {
            CsEvent::SubeventResultContinue {
                session: header.session,
                config_id: header.config_id,
                procedure_done: procedure,
                subevent_done: subevent,
                results: chunk,
            }
        } else {
            CsEvent::SubeventResult {
                session: header.session,
                config_id: header.config_id,
                start_event_counter: header.start_event_counter,
                procedure_counter: header.procedure_counter,
                procedure_done: procedure,
                subevent_done: subevent,
                results: chunk,
            }
        };
        host.on_event(event);
        continuation = true;
    }
    chunks
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cs::StepMode;
    use std::vec::Vec;

    /// An owned copy of a reported event.
    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Recorded {
        Result {
            continuation: bool,
            steps: usize,
            subevent_done: DoneStatus,
            procedure_done: DoneStatus,
            channels: Vec<u8>,
        },
        Disabled(Result<(), Error>),
        TestEnded,
    }

    /// A host that records every event.
    #[derive(Default)]
    pub(crate) struct RecordingHost {
        pub(crate) events: Vec<Recorded>,
    }

    impl RecordingHost {
        pub(crate) fn reported_steps(&self) -> usize {
            self.events
                .iter()
                .map(|event| match event {
                    Recorded::Result { steps, .. } => *steps,
                    _ => 0,
                })
                .sum()
        }
    }

    impl Host for RecordingHost {
        fn on_event(&mut self, event: CsEvent<'_>) {
            let recorded = match event {
                CsEvent::SubeventResult {
                    procedure_done,
                    subevent_done,
                    results,
                    ..
                } => Recorded::Result {
                    continuation: false,
                    steps: results.len(),
                    subevent_done,
                    procedure_done,
                    channels: results.iter().map(|r| r.channel).collect(),
                },
                CsEvent::SubeventResultContinue {
                    procedure_done,
                    subevent_done,
                    results,
                    ..
                } => Recorded::Result {
                    continuation: true,
                    steps: results.len(),
                    subevent_done,
                    procedure_done,
                    channels: results.iter().map(|r| r.channel).collect(),
                },
                CsEvent::ProcedureDisabled { status, .. } => Recorded::Disabled(status),
                CsEvent::TestEnded => Recorded::TestEnded,
            };
            self.events.push(recorded);
        }
    }

    fn header() -> ResultHeader {
        ResultHeader {
            session: SessionId::Test,
            config_id: 0,
            start_event_counter: 7,
            procedure_counter: 1,
        }
    }

    fn results(n: u8) -> Vec<StepResult> {
        (0..n)
            .map(|i| StepResult::new(StepMode::Mode2, i + 2, &[i]).unwrap())
            .collect()
    }

    #[test]
    fn chunked_by_event_limit() {
        let mut host = RecordingHost::default();
        let sent = report_results(
            &mut host,
            &header(),
            false,
            &results(20),
            DoneStatus::Complete,
            DoneStatus::Partial,
        );
        assert_eq!(sent, 3);
        assert_eq!(host.reported_steps(), 20);
        match &host.events[..] {
            [Recorded::Result {
                continuation: false,
                steps: 9,
                subevent_done: DoneStatus::Partial,
                ..
            }, Recorded::Result {
                continuation: true,
                steps: 9,
                ..
            }, Recorded::Result {
                continuation: true,
                steps: 2,
                subevent_done: DoneStatus::Complete,
                procedure_done: DoneStatus::Partial,
                ..
            }] => {}
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[test]
    fn continuation_and_empty() {
        let mut host = RecordingHost::default();
        report_results(
            &mut host,
            &header(),
            true,
            &[],
            DoneStatus::Aborted,
            DoneStatus::Aborted,
        );
        assert_eq!(
            host.events,
            [Recorded::Result {
                continuation: true,
                steps: 0,
                subevent_done: DoneStatus::Aborted,
                procedure_done: DoneStatus::Aborted,
                channels: Vec::new(),
            }]
        );
        assert_eq!(DoneStatus::Aborted.raw(), 0xf);
    }
}
