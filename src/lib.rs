//! Informers, indexed caches and rate limited work queues for Kubernetes
//! controllers.
//!
//! A [`informer::SharedInformerFactory`] hands out one
//! [`informer::SharedIndexInformer`] per distinct watch. Each keeps a
//! [`cache::Store`] current through list-then-watch and fans changes out to
//! any number of handlers. Handlers usually push keys into a
//! [`workqueue::RateLimitingQueue`] that a [`controller::Controller`] drains.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod informer;
pub mod k8s;
pub mod scheduler;
pub mod workqueue;
