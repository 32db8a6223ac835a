//! # mesh-messaging
//!
//! In-process messaging for the meshwire control plane:
//!
//! - [`Broker`] - Topic-typed pub/sub with non-blocking publish and
//!   drop-oldest semantics for slow subscribers
//! - [`Event`] / [`Topic`] - The tagged-union announcement model
//! - [`Dispatcher`] - The singleton loop that coalesces catalog changes
//!   into proxy-broadcast announcements under dual deadlines
//! - [`ShutdownController`] - Lifecycle coordination for the singletons
//!
//! ## Example
//!
//! ```rust,ignore
//! use mesh_messaging::{Broker, Dispatcher, DispatchConfig, Event, ShutdownController, Topic};
//!
//! let broker = Broker::new();
//! let shutdown = ShutdownController::new();
//! Dispatcher::new(broker.clone(), DispatchConfig::default()).spawn(shutdown.signal());
//!
//! broker.publish(Event::new(Topic::ServiceAdded));
//! // ...a single ProxyBroadcast fires once the coalescing window closes.
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod dispatch;
mod event;
mod shutdown;

pub use bus::{Broker, Subscription, SubscriptionId};
pub use dispatch::{DispatchConfig, Dispatcher};
pub use event::{CertificateSummary, Event, ObjectHandle, Topic};
pub use shutdown::{ShutdownController, ShutdownSignal};
