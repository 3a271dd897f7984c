pub mod backend;
pub mod dashboard;
pub mod dispatcher;
pub mod pipeline;
pub mod stomp;
pub mod subscriber;
pub mod surface;
pub mod synchronizer;
pub mod types;
