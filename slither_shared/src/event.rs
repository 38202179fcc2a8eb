//! Event and messaging system.
//!
//! A small typed event hub with one broadcast channel per event type.
//! - Client: length changes, eat sound and game over for UI/audio.
//! - Server: nothing subscribes today; chains still publish through a hub so
//!   a host peer would get the same notifications.
//!
//! Subscriptions are lifecycle-scoped: dropping a [`Subscription`]
//! unsubscribes. Publishing with no subscribers is a no-op.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Local player's length changed (payload: new length).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthChanged(pub u16);

/// Local player ate something; audio plays the eat sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EatSound;

/// Local player lost; UI shows the game-over screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GameOver;

/// Typed event hub.
#[derive(Default)]
pub struct EventHub {
    channels: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender<E: 'static + Clone + Send + Sync>(&mut self) -> &broadcast::Sender<E> {
        self.channels
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(broadcast::channel::<E>(CHANNEL_CAPACITY).0))
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("channel type mismatch")
    }

    /// Subscribes to events of type `E` published from now on.
    pub fn subscribe<E: 'static + Clone + Send + Sync>(&mut self) -> Subscription<E> {
        Subscription {
            rx: self.sender::<E>().subscribe(),
        }
    }

    /// Publishes an event to every live subscription of its type.
    ///
    /// Returns the number of subscriptions that will see it.
    pub fn publish<E: 'static + Clone + Send + Sync>(&self, event: E) -> usize {
        self.channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
            .and_then(|tx| tx.send(event).ok())
            .unwrap_or(0)
    }

    /// Number of live subscriptions for `E`.
    pub fn subscriber_count<E: 'static + Clone + Send + Sync>(&self) -> usize {
        self.channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
            .map_or(0, |tx| tx.receiver_count())
    }
}

/// Receiving end of an event channel.
pub struct Subscription<E> {
    rx: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Returns the next pending event, if any.
    ///
    /// Events dropped because the subscriber lagged are skipped.
    pub fn try_next(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(e) => return Some(e),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drains all pending events.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}
