//! Capability resolution: locating the VM's native entry points.
//!
//! The bridge needs a handful of symbols exported by the VM library. They are
//! found by enumerating the module's exports exactly once; if any required
//! symbol is missing, no table is produced and the bridge is unavailable.
//!
//! Export enumeration itself is an external collaborator, abstracted by
//! [`ExportEnumerator`]. With the `dlopen` feature, [`LibraryExports`] looks up
//! a library through the dynamic loader.

use std::collections::HashMap;
use std::ffi::c_void;

use tracing::debug;

/// Kind of an exported symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Variable,
}

/// One export reported by an [`ExportEnumerator`].
#[derive(Debug, Clone, Copy)]
pub struct ModuleExport<'a> {
    pub name: &'a str,
    pub kind: ExportKind,
    pub address: *const c_void,
}

/// Returned by enumeration callbacks to continue or end the walk early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enumeration {
    Continue,
    Stop,
}

/// Enumerates the exports of a loaded module.
pub trait ExportEnumerator {
    /// Calls `on_match` for each export of `module` until it returns
    /// [`Enumeration::Stop`] or the exports are exhausted. An unknown module
    /// yields no exports.
    fn enumerate_exports(
        &self,
        module: &str,
        on_match: &mut dyn FnMut(&ModuleExport<'_>) -> Enumeration,
    );
}

/// An absolute address inside the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(usize);

impl Address {
    pub fn new(ptr: *const c_void) -> Self {
        Address(ptr as usize)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0 as *const c_void
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Adds a byte offset.
    pub fn add(self, offset: usize) -> Self {
        Address(self.0.wrapping_add(offset))
    }

    /// Reads a pointer stored at this address.
    ///
    /// # Safety
    /// The address must point to readable, pointer-aligned memory.
    pub unsafe fn read_pointer(self) -> *mut c_void {
        *(self.0 as *const *mut c_void)
    }
}

/// An exported function bound for calling.
#[derive(Debug, Clone, Copy)]
pub struct NativeFunction {
    address: Address,
}

impl NativeFunction {
    pub fn address(&self) -> Address {
        self.address
    }

    /// Reinterprets the export as a function pointer of type `F`.
    ///
    /// # Safety
    /// `F` must be an `extern` function pointer type matching the export's
    /// real signature.
    pub unsafe fn bind<F: Copy>(&self) -> F {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        std::mem::transmute_copy(&self.address.0)
    }
}

/// A symbol the bridge cannot work without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredExport {
    /// Exported (possibly mangled) symbol name.
    pub symbol: String,
    /// Name the resolved entry is stored under in the table.
    pub alias: String,
    pub kind: ExportKind,
}

impl RequiredExport {
    pub fn function(symbol: impl Into<String>, alias: impl Into<String>) -> Self {
        RequiredExport { symbol: symbol.into(), alias: alias.into(), kind: ExportKind::Function }
    }

    /// A variable is stored under its own name.
    pub fn variable(symbol: impl Into<String>) -> Self {
        let symbol = symbol.into();
        RequiredExport { alias: symbol.clone(), symbol, kind: ExportKind::Variable }
    }
}

/// Immutable set of resolved entry points and addresses.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    functions: HashMap<String, NativeFunction>,
    variables: HashMap<String, Address>,
}

impl CapabilityTable {
    pub fn function(&self, alias: &str) -> Option<NativeFunction> {
        self.functions.get(alias).copied()
    }

    pub fn variable(&self, name: &str) -> Option<Address> {
        self.variables.get(name).copied()
    }
}

/// Resolves `required` from `module`'s exports.
///
/// Enumeration stops as soon as every required symbol has been seen. Returns
/// `None` unless all of them were found; a partial table is never published.
pub fn resolve(
    enumerator: &dyn ExportEnumerator,
    module: &str,
    required: &[RequiredExport],
) -> Option<CapabilityTable> {
    let mut pending: Vec<&RequiredExport> = required.iter().collect();
    let mut table = CapabilityTable::default();

    if !pending.is_empty() {
        enumerator.enumerate_exports(module, &mut |export| {
            let found = pending.iter().position(|r| r.symbol == export.name && r.kind == export.kind);
            if let Some(index) = found {
                let wanted = pending.swap_remove(index);
                let address = Address::new(export.address);
                match wanted.kind {
                    ExportKind::Function => {
                        table.functions.insert(wanted.alias.clone(), NativeFunction { address });
                    }
                    ExportKind::Variable => {
                        table.variables.insert(wanted.alias.clone(), address);
                    }
                }
            }
            if pending.is_empty() {
                Enumeration::Stop
            } else {
                Enumeration::Continue
            }
        });
    }

    if pending.is_empty() {
        debug!(module, resolved = required.len(), "capability table resolved");
        Some(table)
    } else {
        let missing: Vec<&str> = pending.iter().map(|r| r.symbol.as_str()).collect();
        debug!(module, ?missing, "capability table unavailable");
        None
    }
}

/// Looks up symbols in a library through the platform dynamic loader.
///
/// A loader cannot list exports, so the symbol list names the symbols to look
/// for; each one that resolves is reported as an export. Opened libraries
/// stay loaded for the lifetime of this value.
#[cfg(feature = "dlopen")]
pub struct LibraryExports {
    symbols: Vec<(String, ExportKind)>,
    opened: parking_lot::Mutex<Vec<libloading::Library>>,
}

#[cfg(feature = "dlopen")]
impl LibraryExports {
    pub fn new() -> Self {
        LibraryExports { symbols: Vec::new(), opened: parking_lot::Mutex::new(Vec::new()) }
    }

    /// Looks up every symbol in `required`.
    pub fn for_required(required: &[RequiredExport]) -> Self {
        required.iter().fold(Self::new(), |exports, r| exports.symbol(r.symbol.clone(), r.kind))
    }

    pub fn symbol(mut self, symbol: impl Into<String>, kind: ExportKind) -> Self {
        self.symbols.push((symbol.into(), kind));
        self
    }
}

#[cfg(feature = "dlopen")]
impl Default for LibraryExports {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "dlopen")]
impl ExportEnumerator for LibraryExports {
    fn enumerate_exports(
        &self,
        module: &str,
        on_match: &mut dyn FnMut(&ModuleExport<'_>) -> Enumeration,
    ) {
        let library = match unsafe { libloading::Library::new(module) } {
            Ok(library) => library,
            Err(e) => {
                debug!(module, error = %e, "module could not be opened");
                return;
            }
        };

        for (name, kind) in &self.symbols {
            let address = match unsafe { library.get::<*const c_void>(name.as_bytes()) } {
                Ok(symbol) => *symbol,
                Err(_) => continue,
            };
            let export = ModuleExport { name, kind: *kind, address };
            if on_match(&export) == Enumeration::Stop {
                break;
            }
        }

        self.opened.lock().push(library);
    }
}
