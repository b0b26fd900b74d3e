// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event notifier and subscriber registry.
//!
//! Each subscriber keeps one context slot per unit or controller it has
//! accepted. Holding a slot is what entitles it to that entity's path and
//! removal events:
//!
//! - an add creates the slot on [`Verdict::Accept`]; on [`Verdict::Reject`]
//!   no slot is kept and the entity's sub-events are not delivered;
//! - an add for an entity whose slot already exists is skipped;
//! - a removal is delivered only to holders and always deletes the slot;
//! - path events are delivered with the owning unit's or controller's
//!   context.
//!
//! Additions go to subscribers in registration order, removals in reverse.

use crate::error::DiscoveryError;
use crate::event::DiscoveryEvent;
use crate::model::{ControllerGuid, UnitKey};
use bitflags::bitflags;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace};

bitflags! {
    /// Event classes a subscriber is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventClasses: u8 {
        const UNITS = 0b001;
        const CONTROLLERS = 0b010;
        const PATHS = 0b100;
    }
}

/// Opaque per-entity value owned by a subscriber.
pub type EventContext = Box<dyn Any + Send>;

/// Subscriber answer to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Receives events. Called on the engine task; must not block.
pub trait EventSink: Send {
    fn on_event(&mut self, event: &DiscoveryEvent, context: &mut Option<EventContext>) -> Verdict;
}

impl<F> EventSink for F
where
    F: FnMut(&DiscoveryEvent, &mut Option<EventContext>) -> Verdict + Send,
{
    fn on_event(&mut self, event: &DiscoveryEvent, context: &mut Option<EventContext>) -> Verdict {
        self(event, context)
    }
}

/// Opaque registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationHandle(u64);

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registration #{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ContextKey {
    Unit(UnitKey),
    Controller(UnitKey, ControllerGuid),
}

/// Who a delivery pass is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    /// Replay to a single subscriber
    One(RegistrationHandle),
}

struct Subscriber {
    handle: RegistrationHandle,
    classes: EventClasses,
    sink: Box<dyn EventSink>,
    contexts: BTreeMap<ContextKey, Option<EventContext>>,
}

impl Subscriber {
    /// Deliver one event. Returns true if the sink was called.
    fn deliver(&mut self, event: &DiscoveryEvent) -> bool {
        match event {
            DiscoveryEvent::UnitAdded(e) => {
                self.deliver_add(EventClasses::UNITS, ContextKey::Unit(e.unit), event)
            }
            DiscoveryEvent::UnitRemoved(e) => {
                self.deliver_removal(EventClasses::UNITS, ContextKey::Unit(e.unit), event)
            }
            DiscoveryEvent::ControllerAdded(e) => {
                if self.rejected_unit(e.unit) {
                    return false;
                }
                self.deliver_add(
                    EventClasses::CONTROLLERS,
                    ContextKey::Controller(e.unit, e.guid()),
                    event,
                )
            }
            DiscoveryEvent::ControllerRemoved(e) => self.deliver_removal(
                EventClasses::CONTROLLERS,
                ContextKey::Controller(e.unit, e.guid()),
                event,
            ),
            DiscoveryEvent::PathAdded(e) | DiscoveryEvent::PathRemoved(e) => {
                let (owner, key) = match e.controller {
                    None => (EventClasses::UNITS, ContextKey::Unit(e.unit)),
                    Some(guid) => {
                        (EventClasses::CONTROLLERS, ContextKey::Controller(e.unit, guid))
                    }
                };
                if !self.classes.contains(owner | EventClasses::PATHS) {
                    return false;
                }
                let Some(context) = self.contexts.get_mut(&key) else {
                    return false;
                };
                if self.sink.on_event(event, context) == Verdict::Reject {
                    trace!("{}: {} rejected", self.handle, event.kind());
                }
                true
            }
        }
    }

    /// A subscriber that takes unit events but holds no context for `unit`
    /// rejected it, so nothing beneath the unit reaches it either.
    fn rejected_unit(&self, unit: UnitKey) -> bool {
        self.classes.contains(EventClasses::UNITS)
            && !self.contexts.contains_key(&ContextKey::Unit(unit))
    }

    fn deliver_add(
        &mut self,
        class: EventClasses,
        key: ContextKey,
        event: &DiscoveryEvent,
    ) -> bool {
        if !self.classes.contains(class) || self.contexts.contains_key(&key) {
            return false;
        }
        let mut context = None;
        match self.sink.on_event(event, &mut context) {
            Verdict::Accept => {
                self.contexts.insert(key, context);
            }
            Verdict::Reject => debug!("{}: {} rejected", self.handle, event),
        }
        true
    }

    fn deliver_removal(
        &mut self,
        class: EventClasses,
        key: ContextKey,
        event: &DiscoveryEvent,
    ) -> bool {
        if !self.classes.contains(class) {
            return false;
        }
        let Some(mut context) = self.contexts.remove(&key) else {
            return false;
        };
        self.sink.on_event(event, &mut context);
        true
    }
}

/// Ordered subscriber registry.
#[derive(Default)]
pub struct Notifier {
    subscribers: Vec<Subscriber>,
    next_handle: u64,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber. It receives nothing until the next delivery.
    pub fn register(
        &mut self,
        classes: EventClasses,
        sink: Box<dyn EventSink>,
    ) -> RegistrationHandle {
        self.next_handle += 1;
        let handle = RegistrationHandle(self.next_handle);
        self.subscribers.push(Subscriber {
            handle,
            classes,
            sink,
            contexts: BTreeMap::new(),
        });
        debug!("{} registered for {:?}", handle, classes);
        handle
    }

    /// Remove a subscriber and drop its contexts.
    pub fn deregister(&mut self, handle: RegistrationHandle) -> Result<(), DiscoveryError> {
        let index = self
            .subscribers
            .iter()
            .position(|s| s.handle == handle)
            .ok_or(DiscoveryError::UnknownRegistration(handle))?;
        let subscriber = self.subscribers.remove(index);
        debug!(
            "{} deregistered ({} contexts dropped)",
            handle,
            subscriber.contexts.len()
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, handle: RegistrationHandle) -> bool {
        self.subscribers.iter().any(|s| s.handle == handle)
    }

    /// Deliver events in order. Returns the number of sink calls.
    pub fn deliver(&mut self, events: &[DiscoveryEvent], audience: Audience) -> usize {
        let mut calls = 0;
        for event in events {
            match audience {
                Audience::One(handle) => {
                    let target = self.subscribers.iter_mut().find(|s| s.handle == handle);
                    if let Some(subscriber) = target {
                        calls += usize::from(subscriber.deliver(event));
                    }
                }
                Audience::All if event.is_removal() => {
                    for subscriber in self.subscribers.iter_mut().rev() {
                        calls += usize::from(subscriber.deliver(event));
                    }
                }
                Audience::All => {
                    for subscriber in self.subscribers.iter_mut() {
                        calls += usize::from(subscriber.deliver(event));
                    }
                }
            }
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ControllerEvent, PathEvent, UnitEvent};
    use crate::model::{
        CaGuid, ChassisGuid, ControllerProfile, PathRecord, PortGuid, UnitGuid,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(name: &'static str, log: Log, verdict: Verdict) -> Box<dyn EventSink> {
        Box::new(move |event: &DiscoveryEvent, _ctx: &mut Option<EventContext>| {
            log.lock().push(format!("{}:{}", name, event.kind()));
            verdict
        })
    }

    fn unit_key() -> UnitKey {
        UnitKey::new(CaGuid(1), UnitGuid(2))
    }

    fn unit_event() -> UnitEvent {
        UnitEvent {
            unit: unit_key(),
            chassis_guid: ChassisGuid(0),
            chassis_slot: 0,
            vendor_id: 0,
            device_id: 0,
            revision: 0,
            description: "shelf".into(),
        }
    }

    fn controller_event() -> ControllerEvent {
        ControllerEvent {
            unit: unit_key(),
            slot: 1,
            profile: ControllerProfile {
                guid: ControllerGuid(3),
                ..Default::default()
            },
            service_entries: Vec::new(),
        }
    }

    fn path_event(controller: Option<ControllerGuid>) -> PathEvent {
        PathEvent {
            unit: unit_key(),
            controller,
            port_guid: PortGuid(4),
            path: PathRecord::default(),
        }
    }

    fn added() -> Vec<DiscoveryEvent> {
        vec![
            DiscoveryEvent::UnitAdded(unit_event()),
            DiscoveryEvent::PathAdded(path_event(None)),
            DiscoveryEvent::ControllerAdded(controller_event()),
            DiscoveryEvent::PathAdded(path_event(Some(ControllerGuid(3)))),
        ]
    }

    fn removed() -> Vec<DiscoveryEvent> {
        vec![
            DiscoveryEvent::ControllerRemoved(controller_event()),
            DiscoveryEvent::PathRemoved(path_event(None)),
            DiscoveryEvent::UnitRemoved(unit_event()),
        ]
    }

    #[test]
    fn test_classes_filter_delivery() {
        let log = Log::default();
        let mut notifier = Notifier::new();
        notifier.register(EventClasses::UNITS, recorder("u", log.clone(), Verdict::Accept));
        notifier.register(
            EventClasses::CONTROLLERS | EventClasses::PATHS,
            recorder("c", log.clone(), Verdict::Accept),
        );

        let calls = notifier.deliver(&added(), Audience::All);
        assert_eq!(calls, 3);
        assert_eq!(
            *log.lock(),
            vec!["u:unit-added", "c:controller-added", "c:path-added"]
        );
    }

    #[test]
    fn test_reject_stops_subtree_for_that_subscriber_only() {
        let log = Log::default();
        let mut notifier = Notifier::new();
        let all = EventClasses::all();
        notifier.register(all, recorder("a", log.clone(), Verdict::Reject));
        notifier.register(all, recorder("b", log.clone(), Verdict::Accept));

        notifier.deliver(&added(), Audience::All);
        assert_eq!(
            *log.lock(),
            vec![
                "a:unit-added",
                "b:unit-added",
                "b:path-added",
                "b:controller-added",
                "b:path-added",
            ]
        );

        // No context, no removal
        log.lock().clear();
        notifier.deliver(&removed(), Audience::All);
        assert_eq!(
            *log.lock(),
            vec!["b:controller-removed", "b:path-removed", "b:unit-removed"]
        );
    }

    #[test]
    fn test_rejected_unit_hides_accepted_controllers() {
        let log = Log::default();
        let sink_log = log.clone();
        let mut notifier = Notifier::new();
        notifier.register(
            EventClasses::all(),
            Box::new(move |event: &DiscoveryEvent, _: &mut Option<EventContext>| {
                sink_log.lock().push(event.kind().to_string());
                match event {
                    DiscoveryEvent::UnitAdded(_) => Verdict::Reject,
                    _ => Verdict::Accept,
                }
            }),
        );

        assert_eq!(notifier.deliver(&added(), Audience::All), 1);
        assert_eq!(notifier.deliver(&removed(), Audience::All), 0);
        assert_eq!(*log.lock(), vec!["unit-added"]);

        // A controllers-only subscriber has no unit to reject
        notifier.register(EventClasses::CONTROLLERS, recorder("c", log.clone(), Verdict::Accept));
        log.lock().clear();
        notifier.deliver(&added()[2..3], Audience::All);
        assert_eq!(*log.lock(), vec!["c:controller-added"]);
    }

    #[test]
    fn test_removals_in_reverse_registration_order() {
        let log = Log::default();
        let mut notifier = Notifier::new();
        notifier.register(EventClasses::UNITS, recorder("first", log.clone(), Verdict::Accept));
        notifier.register(EventClasses::UNITS, recorder("second", log.clone(), Verdict::Accept));

        notifier.deliver(&added()[..1], Audience::All);
        notifier.deliver(&removed()[2..], Audience::All);
        assert_eq!(
            *log.lock(),
            vec![
                "first:unit-added",
                "second:unit-added",
                "second:unit-removed",
                "first:unit-removed",
            ]
        );
    }

    #[test]
    fn test_replay_is_idempotent() {
        let log = Log::default();
        let mut notifier = Notifier::new();
        let sink = recorder("s", log.clone(), Verdict::Accept);
        let handle = notifier.register(EventClasses::all(), sink);

        assert_eq!(notifier.deliver(&added(), Audience::One(handle)), 4);
        assert_eq!(notifier.deliver(&added(), Audience::All), 2);
        // Only the path events went out again
        assert_eq!(log.lock().iter().filter(|l| l.ends_with("unit-added")).count(), 1);
    }

    #[test]
    fn test_context_survives_between_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let mut notifier = Notifier::new();
        notifier.register(
            EventClasses::UNITS | EventClasses::PATHS,
            Box::new(move |event: &DiscoveryEvent, ctx: &mut Option<EventContext>| {
                match event {
                    DiscoveryEvent::UnitAdded(_) => *ctx = Some(Box::new(41u32)),
                    _ => {
                        if let Some(value) = ctx.as_mut().and_then(|c| c.downcast_mut::<u32>()) {
                            *value += 1;
                            sink_seen.lock().push(*value);
                        }
                    }
                }
                Verdict::Accept
            }),
        );

        notifier.deliver(&added(), Audience::All);
        notifier.deliver(&removed(), Audience::All);
        assert_eq!(*seen.lock(), vec![42, 43, 44]);
    }

    #[test]
    fn test_deregister() {
        let log = Log::default();
        let mut notifier = Notifier::new();
        let sink = recorder("s", log.clone(), Verdict::Accept);
        let handle = notifier.register(EventClasses::UNITS, sink);
        assert!(notifier.deregister(handle).is_ok());
        assert!(matches!(
            notifier.deregister(handle),
            Err(DiscoveryError::UnknownRegistration(_))
        ));
        assert_eq!(notifier.deliver(&added(), Audience::All), 0);
    }
}
