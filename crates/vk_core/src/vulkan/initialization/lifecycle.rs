//! Lifecycle observers
//!
//! Subsystems that derive state from the device or the swapchain (command
//! pools, framebuffers, per-swapchain pipelines) subscribe here and are
//! notified in registration order. The bus is generic over the context it
//! hands to observers so it can be driven without a GPU.

use std::collections::HashMap;

/// Points in the device/swapchain lifecycle observers can hook into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The logical device was just created
    CreateDevice,
    /// The logical device is about to be destroyed
    DestroyDevice,
    /// A swapchain and its views were just created
    CreateSwapchain,
    /// The swapchain views are about to be destroyed
    DestroySwapchain,
}

/// Observer invoked with the context that fired the event
pub type LifecycleObserver<C> = Box<dyn FnMut(&C)>;

/// Ordered observer lists keyed by [`LifecycleEvent`]
pub struct LifecycleBus<C> {
    observers: HashMap<LifecycleEvent, Vec<LifecycleObserver<C>>>,
}

impl<C> Default for LifecycleBus<C> {
    fn default() -> Self {
        Self {
            observers: HashMap::new(),
        }
    }
}

impl<C> LifecycleBus<C> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `observer` to `event`; it runs after every earlier subscriber
    pub fn subscribe<F>(&mut self, event: LifecycleEvent, observer: F)
    where
        F: FnMut(&C) + 'static,
    {
        self.observers.entry(event).or_default().push(Box::new(observer));
    }

    /// Notify every observer of `event` in registration order
    pub fn notify(&mut self, event: LifecycleEvent, context: &C) {
        if let Some(observers) = self.observers.get_mut(&event) {
            log::debug!("Notifying {} observer(s) of {:?}", observers.len(), event);
            for observer in observers.iter_mut() {
                observer(context);
            }
        }
    }

    /// Number of observers subscribed to `event`
    pub fn observer_count(&self, event: LifecycleEvent) -> usize {
        self.observers.get(&event).map_or(0, Vec::len)
    }

    /// Drop every observer
    pub fn clear(&mut self) {
        self.observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    fn record(log: &Log, entry: &'static str) -> impl FnMut(&()) + 'static {
        let log = Rc::clone(log);
        move |_: &()| log.borrow_mut().push(entry)
    }

    #[test]
    fn test_observers_run_in_registration_order() {
        let log: Log = Rc::default();
        let mut bus = LifecycleBus::<()>::new();
        bus.subscribe(LifecycleEvent::CreateSwapchain, record(&log, "framebuffers"));
        bus.subscribe(LifecycleEvent::CreateSwapchain, record(&log, "pipelines"));
        bus.subscribe(LifecycleEvent::DestroySwapchain, record(&log, "drop framebuffers"));
        bus.subscribe(LifecycleEvent::DestroySwapchain, record(&log, "drop pipelines"));

        // The order a swapchain rebuild notifies in
        bus.notify(LifecycleEvent::DestroySwapchain, &());
        bus.notify(LifecycleEvent::CreateSwapchain, &());

        assert_eq!(
            *log.borrow(),
            vec!["drop framebuffers", "drop pipelines", "framebuffers", "pipelines"]
        );
    }

    #[test]
    fn test_events_are_isolated() {
        let log: Log = Rc::default();
        let mut bus = LifecycleBus::<()>::new();
        bus.subscribe(LifecycleEvent::CreateDevice, record(&log, "device"));

        bus.notify(LifecycleEvent::CreateSwapchain, &());
        assert!(log.borrow().is_empty());
        assert_eq!(bus.observer_count(LifecycleEvent::CreateDevice), 1);
        assert_eq!(bus.observer_count(LifecycleEvent::DestroyDevice), 0);
    }

    #[test]
    fn test_observer_sees_context() {
        let seen = Rc::new(RefCell::new(0u32));
        let mut bus = LifecycleBus::<u32>::new();
        let sink = Rc::clone(&seen);
        bus.subscribe(LifecycleEvent::DestroyDevice, move |value: &u32| *sink.borrow_mut() += *value);

        bus.notify(LifecycleEvent::DestroyDevice, &7);
        bus.notify(LifecycleEvent::DestroyDevice, &5);
        assert_eq!(*seen.borrow(), 12);
    }
}
