//! Push-mode delivery as a stream of [`PushEvent`]s.
//!
//! Event order: one `status`, then `progress` and `ping` events interleaved
//! on their own ticks, then exactly one `completed` carrying the full output.
//! A session that is already terminal on connect gets `status` then
//! `completed` and nothing else.

use std::time::Duration;

use chatrelay_types::event::PushEvent;
use futures_util::Stream;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use super::observer::Observer;

enum Tick {
    Progress,
    Ping,
}

/// Turn an observer into a push event stream.
///
/// The stream ends after the `completed` event. Dropping it early (client
/// gone) has no effect on the session.
pub fn push_events(
    mut observer: Observer,
    progress_tick: Duration,
    ping_interval: Duration,
) -> impl Stream<Item = PushEvent> + Send {
    async_stream::stream! {
        yield PushEvent::Status { status: observer.view() };

        if !observer.is_terminal() {
            let start = Instant::now();
            let mut progress = interval_at(start + progress_tick, progress_tick);
            progress.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ping = interval_at(start + ping_interval, ping_interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let tick = tokio::select! {
                    _ = progress.tick() => Tick::Progress,
                    _ = ping.tick() => Tick::Ping,
                };

                match tick {
                    Tick::Progress => {
                        let fresh = observer.pull();
                        if !fresh.is_empty() {
                            yield PushEvent::Progress {
                                progress: fresh,
                                status: observer.status(),
                            };
                        }
                    }
                    Tick::Ping => yield PushEvent::Ping,
                }

                if observer.is_terminal() {
                    break;
                }
            }
        }

        yield PushEvent::Completed {
            status: observer.view(),
            progress: observer.total_progress(),
        };
    }
}
