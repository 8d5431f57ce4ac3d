/*!
A user-space socket multiplexer.

Clients open logical sockets over in-process IPC (a request channel plus a
data transport per socket); the multiplexer bridges them to non-blocking host
BSD sockets. A single dispatcher thread owns all state and interleaves three
readiness domains: host fds via a level-triggered `poll`, IPC data handles
via a wait-set drained by a watcher thread, and new requests on the request
channels.

# Example
```no_run
use sockmux::{client, Config, Multiplexer};

let mux = Multiplexer::spawn(Config::new())?;
let sock = client::open(mux.control(), "socket/2/1/0")
    .map_err(|e| std::io::Error::other(e.to_string()))?;
sock.connect_wait(&"127.0.0.1:7000".parse().unwrap())
    .map_err(|e| std::io::Error::other(e.to_string()))?;
sock.send(b"hello").map_err(|e| std::io::Error::other(e.to_string()))?;
mux.shutdown()?;
# Ok::<(), std::io::Error>(())
```
*/

pub mod client;
pub mod ipc;
pub mod net;
pub mod proto;

mod buffer;
mod dispatcher;
mod events;
mod handlers;
mod iostate;
mod queue;
mod request;
mod status;
mod watcher;

pub use dispatcher::{Config, Multiplexer};
pub use request::OpCode;
pub use status::Status;
