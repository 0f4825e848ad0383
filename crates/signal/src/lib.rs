#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A signal is either a `TimerTick` (triggered by a configured timer) or a
//! batch of domain messages. [`SignalReceiver`] is the interface a
//! single-task driving loop uses to receive both kinds from one `recv()`
//! call — the correlator's admit/resolve/sweep loop is built directly on
//! top of it, pairing admission and resolution events with a periodic sweep
//! tick instead of juggling a channel and a separate timer by hand.

use std::{
    fmt::{Display, Formatter},
    time::{Duration, Instant},
};

use futures::{
    future::{select, Either},
    pin_mut,
};

/// A signal received by a single-task driving loop — e.g. the correlator's
/// admit/resolve/sweep task, or a respondee's mailbox task.
#[derive(Debug)]
#[non_exhaustive]
pub enum Signal<Msg: 'static + Clone + Send> {
    /// Signal variant triggered by a timer.
    TimerTick {
        /// Timestamp of the signal.
        instant: Instant,
        /// Origin of the timer (distinguishes multiple timers feeding the same loop).
        timer_source: usize,
    },
    /// Signal variant triggered by the reception of a batch of messages.
    Messages {
        /// Messages received.
        messages: Vec<Msg>,
    },
    /// Signal variant received when the driving loop must stop.
    Stop,
}

/// Set of methods exposed by a signal.
impl<Msg> Signal<Msg>
where
    Msg: 'static + Clone + Send,
{
    /// Returns the name of this signal.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::TimerTick { .. } => "TimerTick",
            Signal::Messages { .. } => "Messages",
            Signal::Stop => "Stop",
        }
    }
}

impl<Msg> Display for Signal<Msg>
where
    Msg: 'static + Clone + Send,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A receiver that can be used to receive signals on a driving loop's task.
pub enum SignalReceiver<Msg>
where
    Msg: 'static + Clone + Send,
{
    /// A signal receiver with only a flume receiver — no timer, so `recv()`
    /// only ever yields `Messages`/`Stop`.
    Receiver {
        /// A flume receiver.
        receiver: flume::Receiver<Vec<Msg>>,
    },
    /// A signal receiver with a flume receiver and a tokio interval timer,
    /// racing the two on every `recv()` call — the shape the correlator's
    /// sweeper uses to wake up periodically alongside admit/resolve traffic.
    ReceiverInterval {
        /// A flume receiver.
        receiver: flume::Receiver<Vec<Msg>>,
        /// The origin of the timer.
        timer_source: usize,
        /// The interval of the timer.
        interval: tokio::time::Interval,
    },
}

impl<Msg> SignalReceiver<Msg>
where
    Msg: 'static + Clone + Send,
{
    /// Creates a new receiver with no timer.
    pub fn with_receiver(receiver: flume::Receiver<Vec<Msg>>) -> Self {
        SignalReceiver::Receiver { receiver }
    }

    /// Creates a new receiver that also yields `Signal::TimerTick` every
    /// `duration`, interleaved with incoming message batches.
    pub fn with_receiver_timer(receiver: flume::Receiver<Vec<Msg>>, duration: Duration, timer_source: usize) -> Self {
        SignalReceiver::ReceiverInterval {
            receiver,
            timer_source,
            interval: tokio::time::interval(duration),
        }
    }

    /// Returns the next signal for the driving loop to process.
    pub async fn recv(&mut self) -> Signal<Msg> {
        match self {
            SignalReceiver::Receiver { receiver } => match receiver.recv_async().await {
                Ok(messages) => Signal::Messages { messages },
                Err(err) => {
                    tracing::warn!("Error receiving messages (Flume MPMC channel): {}", err);
                    Signal::Stop
                }
            },
            SignalReceiver::ReceiverInterval {
                receiver,
                interval,
                timer_source,
            } => {
                let interval_fut = interval.tick();
                let receiver_fut = receiver.recv_async();

                pin_mut!(interval_fut, receiver_fut);

                match select(interval_fut, receiver_fut).await {
                    Either::Left((instant, _)) => Signal::TimerTick {
                        instant: instant.into_std(),
                        timer_source: *timer_source,
                    },
                    Either::Right((messages, _)) => match messages {
                        Ok(messages) => Signal::Messages { messages },
                        Err(err) => {
                            tracing::warn!("Error receiving messages (Flume MPMC channel): {}", err);
                            Signal::Stop
                        }
                    },
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{Signal, SignalReceiver};

    #[tokio::test]
    async fn test() {
        let (sender, receiver) = flume::bounded(10);
        let mut message_stream = SignalReceiver::with_receiver_timer(receiver, Duration::from_secs(1), 0);

        sender.send_async(vec!["test1".to_string()]).await.unwrap();
        sender.send_async(vec!["test2".to_string()]).await.unwrap();

        match message_stream.recv().await {
            Signal::TimerTick { .. } => panic!("TimerTick signal received before messages"),
            Signal::Messages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0], "test1".to_string());
            }
            Signal::Stop => panic!("Stop signal received before messages"),
        }

        match message_stream.recv().await {
            Signal::TimerTick { .. } => panic!("TimerTick signal received before messages"),
            Signal::Messages { messages } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0], "test2".to_string());
            }
            Signal::Stop => panic!("Stop signal received before messages"),
        }

        match message_stream.recv().await {
            Signal::TimerTick { .. } => { /*OK*/ }
            Signal::Messages { .. } => panic!("MessagesReceived signal received after all messages consumed"),
            Signal::Stop => panic!("Stop signal received before messages"),
        }
    }
}
