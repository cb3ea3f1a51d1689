//! Loopback HTTP control and query API.
//!
//! Bound to `127.0.0.1` only. Routes:
//!
//! | Route                               | Effect                            |
//! |-------------------------------------|-----------------------------------|
//! | `GET /status`                       | state counts, queue depth, flags  |
//! | `GET /conflicts`                    | objects awaiting manual resolution|
//! | `POST /resolve/{id}?choice=local`   | resolve a conflict                |
//! | `POST /pin/{id}`                    | pin an object                     |
//! | `POST /pause` / `POST /resume`      | stop/restart claiming             |
//!
//! Responses are JSON. The server owns no state of its own; everything is
//! read from the store or toggled on the engine's connectivity flags.

mod routes;
mod server;

pub use routes::{ResolveChoice, StatusReport};
pub use server::ControlServer;
