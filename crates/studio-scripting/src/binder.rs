//! Runtime binding of a foreign library's entry points.
//!
//! A [`SymbolTable`] is a struct of typed function pointers whose field names
//! are the exported symbol names. Binding is all-or-nothing: the first symbol
//! that fails to resolve aborts the bind, and the library handle that was
//! opened for it is dropped (closed) before the error is returned. A caller
//! holding a [`BoundLibrary`] can rely on every slot being valid.
//!
//! Symbols are looked up through the [`SymbolSource`] trait so the binding
//! logic can be exercised without a real shared library.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use libloading::Library;

use crate::error::BindError;

/// Something symbols can be resolved against.
pub trait SymbolSource {
    /// Human-readable name used in diagnostics (usually the library path).
    fn describe(&self) -> String;

    /// Address of the exported symbol `name`, or `None` when it is absent.
    fn resolve(&self, name: &str) -> Option<NonNull<c_void>>;
}

/// A fixed, enumerated set of entry points bound into typed slots.
///
/// Implemented through [`symbol_table!`](crate::symbol_table).
pub trait SymbolTable: Sized {
    /// Every required symbol, in binding order.
    const SYMBOLS: &'static [&'static str];

    /// Build the table, resolving each symbol through `lookup` in
    /// [`Self::SYMBOLS`] order. Returns the first name that did not resolve.
    ///
    /// # Safety
    ///
    /// Every address `lookup` returns must point at an entry point whose ABI
    /// matches the type of the slot it is stored into.
    unsafe fn bind_with(
        lookup: &mut dyn FnMut(&'static str) -> Option<NonNull<c_void>>,
    ) -> Result<Self, &'static str>;
}

/// Declare a [`SymbolTable`]: a struct of typed function pointers whose field
/// names double as the exported symbol names.
///
/// ```ignore
/// symbol_table! {
///     pub struct MathApi {
///         cos: unsafe extern "C" fn(f64) -> f64,
///         sin: unsafe extern "C" fn(f64) -> f64,
///     }
/// }
/// ```
#[macro_export]
macro_rules! symbol_table {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $( $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[allow(non_snake_case)]
        #[derive(Clone, Copy)]
        $vis struct $name {
            $( pub $field: $ty, )*
        }

        impl $crate::binder::SymbolTable for $name {
            const SYMBOLS: &'static [&'static str] = &[$( stringify!($field) ),*];

            unsafe fn bind_with(
                lookup: &mut dyn FnMut(
                    &'static str,
                ) -> Option<::std::ptr::NonNull<::std::ffi::c_void>>,
            ) -> ::std::result::Result<Self, &'static str> {
                Ok(Self {
                    $(
                        $field: {
                            let address = lookup(stringify!($field)).ok_or(stringify!($field))?;
                            // SAFETY: the caller guarantees the symbol has this signature.
                            unsafe {
                                ::std::mem::transmute::<*mut ::std::ffi::c_void, $ty>(
                                    address.as_ptr(),
                                )
                            }
                        },
                    )*
                })
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("symbols", &<Self as $crate::binder::SymbolTable>::SYMBOLS.len())
                    .finish()
            }
        }
    };
}

/// Resolve every symbol of `T` against `source`.
///
/// # Safety
///
/// The symbols exported by `source` must have the signatures declared by `T`.
pub unsafe fn bind_symbols<T: SymbolTable>(source: &dyn SymbolSource) -> Result<T, BindError> {
    let mut lookup = |name: &'static str| source.resolve(name);
    // SAFETY: forwarded from the caller.
    unsafe { T::bind_with(&mut lookup) }.map_err(|symbol| BindError::MissingSymbol {
        symbol,
        library: source.describe(),
    })
}

/// Full path of the shared library `base_name` inside `search_dir`.
///
/// The file name carries the platform's prefix and suffix (`libpython3.so`,
/// `python3.dll`, ...). An empty `search_dir` yields the bare file name so
/// the platform loader's default search applies.
pub fn library_path(search_dir: &str, base_name: &str) -> PathBuf {
    let file_name = libloading::library_filename(base_name);
    let dir = search_dir.replace('\\', "/");
    if dir.is_empty() {
        PathBuf::from(file_name)
    } else {
        Path::new(&dir).join(file_name)
    }
}

/// An opened shared library, remembered together with the path it was
/// opened from.
pub struct OpenLibrary {
    path: PathBuf,
    library: Library,
}

impl OpenLibrary {
    /// Open the library at `path`.
    ///
    /// # Safety
    ///
    /// Loading a library runs its initialisation routines; the library must
    /// be sound to load into this process.
    pub unsafe fn open(path: &Path) -> Result<Self, BindError> {
        // SAFETY: forwarded from the caller.
        let library = unsafe { Library::new(path) }.map_err(|source| BindError::LibraryOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for OpenLibrary {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn resolve(&self, name: &str) -> Option<NonNull<c_void>> {
        let mut symbol = Vec::with_capacity(name.len() + 1);
        symbol.extend_from_slice(name.as_bytes());
        symbol.push(0);
        // SAFETY: the address is only read as an opaque pointer here; its
        // type is imposed by the table it is bound into.
        let address = unsafe { self.library.get::<*mut c_void>(&symbol) }.ok()?;
        NonNull::new(*address)
    }
}

impl std::fmt::Debug for OpenLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenLibrary")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A fully bound symbol table together with the library that backs it.
///
/// The library handle lives exactly as long as the table; there is no way to
/// obtain the table without the handle.
#[derive(Debug)]
pub struct BoundLibrary<T> {
    table: T,
    library: OpenLibrary,
}

impl<T> BoundLibrary<T> {
    pub fn path(&self) -> &Path {
        self.library.path()
    }
}

impl<T> Deref for BoundLibrary<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.table
    }
}

/// Open `base_name` from `search_dir` and bind every symbol of `T`.
///
/// On failure the library is closed again and one warning naming the
/// library path or the missing symbol is logged.
///
/// # Safety
///
/// The library must be sound to load, and its exported symbols must have the
/// signatures declared by `T`.
pub unsafe fn bind_runtime<T: SymbolTable>(
    search_dir: &str,
    base_name: &str,
) -> Result<BoundLibrary<T>, BindError> {
    let path = library_path(search_dir, base_name);

    // SAFETY: forwarded from the caller.
    let library = match unsafe { OpenLibrary::open(&path) } {
        Ok(library) => library,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Could not load runtime library");
            return Err(err);
        }
    };

    // SAFETY: forwarded from the caller.
    match unsafe { bind_symbols::<T>(&library) } {
        Ok(table) => {
            tracing::debug!(
                path = %path.display(),
                symbols = T::SYMBOLS.len(),
                "Bound runtime library"
            );
            Ok(BoundLibrary { table, library })
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                symbol = err.missing_symbol().unwrap_or_default(),
                "Failed to import runtime symbol"
            );
            drop(library);
            Err(err)
        }
    }
}

/// In-memory [`SymbolSource`] mapping names to addresses.
#[derive(Debug, Default, Clone)]
pub struct StaticSymbols {
    name: String,
    symbols: HashMap<String, usize>,
}

impl StaticSymbols {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            symbols: HashMap::new(),
        }
    }

    /// Export `address` under `name`.
    pub fn insert(&mut self, name: impl Into<String>, address: *const c_void) -> &mut Self {
        self.symbols.insert(name.into(), address as usize);
        self
    }

    pub fn remove(&mut self, name: &str) -> &mut Self {
        self.symbols.remove(name);
        self
    }
}

impl SymbolSource for StaticSymbols {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn resolve(&self, name: &str) -> Option<NonNull<c_void>> {
        self.symbols
            .get(name)
            .and_then(|address| NonNull::new(*address as *mut c_void))
    }
}
