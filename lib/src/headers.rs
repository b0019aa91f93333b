//! The shared header-id table and the configured header injectors.
//!
//! Header ids are allocated while the server wires itself up and stay valid
//! for the life of the process. The table has two phases, enforced by two
//! types: a [`HeaderTableBuilder`] that allocates ids, and the frozen
//! [`HeaderTable`] that resolves them. Once the table is built, further
//! allocation is a programming error and aborts.

use crate::error::Error;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::{Arc, Mutex, OnceLock};

/// A stable index for a header name registered during startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderId(usize);

struct TableState {
    building: Mutex<Option<Vec<HeaderName>>>,
    frozen: OnceLock<Vec<HeaderName>>,
}

/// Allocates header ids during server construction.
///
/// Cloning is shallow; all clones feed the same table. Calling
/// [`HeaderTableBuilder::build`] freezes the table for every outstanding
/// [`HeaderTable`] handle.
#[derive(Clone)]
pub struct HeaderTableBuilder {
    state: Arc<TableState>,
}

impl HeaderTableBuilder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TableState {
                building: Mutex::new(Some(Vec::new())),
                frozen: OnceLock::new(),
            }),
        }
    }

    /// Registers a header name, returning its id.
    ///
    /// Panics if the table has already been frozen: every header must be
    /// registered before the first listener can accept a connection.
    pub fn add(&self, name: &str) -> Result<HeaderId, Error> {
        let mut guard = self.state.building.lock().unwrap();
        let names = guard
            .as_mut()
            .expect("header table is frozen; no new header ids may be allocated");
        let name = HeaderName::from_bytes(name.as_bytes())?;
        let id = HeaderId(names.len());
        names.push(name);
        Ok(id)
    }

    /// Returns a handle that will resolve ids once the table is frozen.
    pub fn future_table(&self) -> HeaderTable {
        HeaderTable {
            state: self.state.clone(),
        }
    }

    /// Freezes the table. All previously issued handles become usable.
    pub fn build(self) -> HeaderTable {
        let names = self
            .state
            .building
            .lock()
            .unwrap()
            .take()
            .expect("header table built twice");
        let _ = self.state.frozen.set(names);
        HeaderTable {
            state: self.state,
        }
    }
}

impl Default for HeaderTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The frozen header table. Read-only and freely shareable.
#[derive(Clone)]
pub struct HeaderTable {
    state: Arc<TableState>,
}

impl HeaderTable {
    /// Resolves an id to its header name.
    ///
    /// Panics if called before the builder froze the table; requests must
    /// not be processed until wiring completes.
    pub fn name(&self, id: HeaderId) -> &HeaderName {
        let names = self
            .state
            .frozen
            .get()
            .expect("header table used before it was frozen");
        &names[id.0]
    }
}

/// An ordered list of configured header edits.
///
/// An entry with a value sets (overwrites) the header; an entry without one
/// removes every occurrence. Entries apply in configured order, so the last
/// edit of a name wins.
pub struct HeaderInjector {
    headers: Vec<InjectedHeader>,
}

struct InjectedHeader {
    id: HeaderId,
    value: Option<HeaderValue>,
}

impl HeaderInjector {
    pub fn new<'a>(
        entries: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
        builder: &HeaderTableBuilder,
    ) -> Result<Self, Error> {
        let headers = entries
            .into_iter()
            .map(|(name, value)| {
                Ok(InjectedHeader {
                    id: builder.add(name)?,
                    value: value.map(HeaderValue::from_str).transpose()?,
                })
            })
            .collect::<Result<_, Error>>()?;
        Ok(Self { headers })
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn apply(&self, table: &HeaderTable, headers: &mut HeaderMap) {
        for header in &self.headers {
            let name = table.name(header.id);
            match &header.value {
                Some(value) => {
                    headers.insert(name.clone(), value.clone());
                }
                None => {
                    headers.remove(name);
                }
            }
        }
    }
}
