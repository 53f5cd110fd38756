//! An append-only multicast callback list (§9 "Event handler lists"), the Rust shape of
//! `original_source/pytidenetworking/utils/eventhandler.py`'s `EventHandler`.
//!
//! Subscription is by opaque [`SubscriptionId`] rather than by comparing closures (Rust closures
//! aren't `PartialEq`), so `unsubscribe` stays the linear search the original performs but keyed
//! on an id instead of identity. Dispatch is synchronous and single-threaded, same as the
//! original's `__call__`, so a handler removed mid-dispatch is simply skipped by the id check
//! rather than racing the caller.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventList<T> {
	next_id: u64,
	handlers: Vec<(SubscriptionId, Box<dyn FnMut(&T) + Send>)>,
}

impl<T> EventList<T> {
	pub fn new() -> Self {
		Self { next_id: 0, handlers: Vec::new() }
	}

	/// Register a new handler, invoked in registration order on every future [`fire`](Self::fire).
	pub fn subscribe(&mut self, handler: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
		let id = SubscriptionId(self.next_id);
		self.next_id += 1;
		self.handlers.push((id, Box::new(handler)));
		id
	}

	/// Remove a previously registered handler. A no-op if `id` is unknown or already removed.
	pub fn unsubscribe(&mut self, id: SubscriptionId) {
		self.handlers.retain(|(h, _)| *h != id);
	}

	/// Invoke every registered handler, in registration order, with a shared reference to `event`.
	pub fn fire(&mut self, event: &T) {
		for (_, handler) in &mut self.handlers {
			handler(event);
		}
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

impl<T> Default for EventList<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> std::fmt::Debug for EventList<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventList").field("handlers", &self.handlers.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	#[test]
	fn handlers_fire_in_registration_order() {
		let order = Arc::new(std::sync::Mutex::new(Vec::new()));
		let mut list: EventList<u32> = EventList::new();

		let o1 = order.clone();
		list.subscribe(move |_| o1.lock().unwrap().push(1));
		let o2 = order.clone();
		list.subscribe(move |_| o2.lock().unwrap().push(2));

		list.fire(&0);
		assert_eq!(*order.lock().unwrap(), vec![1, 2]);
	}

	#[test]
	fn unsubscribe_stops_future_dispatch() {
		let count = Arc::new(AtomicU32::new(0));
		let mut list: EventList<()> = EventList::new();

		let c = count.clone();
		let id = list.subscribe(move |_| {
			c.fetch_add(1, Ordering::SeqCst);
		});

		list.fire(&());
		list.unsubscribe(id);
		list.fire(&());

		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}
