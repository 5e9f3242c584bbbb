// Copyright (c) 2016 Daniel Grunwald
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this
// software and associated documentation files (the "Software"), to deal in the Software
// without restriction, including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons
// to whom the Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED,
// INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR
// PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE
// FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR
// OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

/*!
`structured-cancellation` is a hierarchical cancellation and operation-lifecycle
framework for async Rust. At its core sits [`Token`], a one-shot cancellation latch
that async code cooperatively checks or subscribes to. [`Scope`] builds on top of it:
a bounded, named region of work with its own token, attached [`Source`]s (timeouts,
signals, predicates, composites), children, and a recorded terminal status.

Operations that support cancellation accept a `token: &Token` (or capture it from the
enclosing [`Scope`]) and cooperatively call `token.raise_if_cancelled()?` between units
of work:

```rust
use structured_cancellation::{CancellationError, Token};

fn cancellable_sum(values: &[i32], token: &Token) -> Result<i32, CancellationError> {
    let mut sum = 0;
    for val in values {
        token.raise_if_cancelled()?;
        sum += val;
    }
    Ok(sum)
}

# fn main() {
let token = Token::new();
assert_eq!(cancellable_sum(&[1, 2, 3], &token), Ok(6));
# }
```

Most applications drive this through a [`Scope`] rather than a bare `Token`, since a
scope also gets a lifecycle (`Pending` → `Running` → a terminal status), a timeout or
signal source wired up for you, and a recorded [`OperationContext`] snapshot other code
can observe:

```rust
use std::time::Duration;
use structured_cancellation::{CancellationError, ScopeBuilder};

# #[tokio::main]
# async fn main() {
let scope = ScopeBuilder::with_timeout(Duration::from_millis(50))
    .unwrap()
    .name("slow-download")
    .build();

let result: Result<(), CancellationError> = scope
    .run(|s| async move {
        loop {
            s.token().raise_if_cancelled()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

assert!(result.is_err());
assert_eq!(scope.context().cancel_reason, Some(structured_cancellation::Reason::Timeout));
# }
```

Cancellation that originates off the owning event loop — an OS signal, a worker thread,
a callback from another runtime — never touches `Token`/`Scope` state directly; it is
routed through [`Bridge::call_soon_threadsafe`], which queues the callable for the loop
that owns the token to run in submission order.

The process-wide [`Registry`] tracks every [`Scope`] built with
`.register_globally(true)`, so unrelated code (an admin endpoint, a signal handler, a
test harness) can list, cancel, or inspect the history of in-flight operations without
being handed the `Scope` directly.
*/

mod bridge;
pub mod decorators;
mod error;
mod registry;
pub mod source;
mod scope;
mod stream;
mod token;

pub use bridge::{Bridge, QUEUE_CAPACITY};
pub use decorators::{cancellable, cancellable_method, with_current_operation, with_timeout, CancellableOptions};
pub use error::{CancellationError, Result};
pub use registry::{Registry, RegistryStatistics, DEFAULT_HISTORY_CAPACITY};
pub use scope::{
    OperationContext, Scope, ScopeBuilder, ScopeGuard, ScopeStatus, ShieldGuard, ProgressEvent,
};
pub use source::{CompositeMode, CompositeSource, PredicateSource, Source, SignalSource, TimeoutSource};
#[cfg(feature = "resource-metrics")]
pub use source::ResourcePredicate;
pub use stream::{cancellable_stream, cancellable_stream_chunked, BUFFER_CAPACITY};
pub use token::{Reason, Token};
