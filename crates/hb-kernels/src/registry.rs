//! Named kernel entry points with fixed argument signatures.
//!
//! The host binds a kernel by name and passes positional arguments; the
//! registry checks them against the registered signature before anything
//! runs on the group.

use crate::error::{KernelError, Result};
use crate::eyeriss::{self, EyerissConfig};
use crate::group::TileGroup;
use crate::index_add::{self, IndexAddConfig};
use crate::mm;
use crate::tensor::Tensor;
use std::fmt;
use tracing::debug;

/// Status returned by a successful invocation.
pub const STATUS_OK: i32 = 0;

/// Type of one positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// `f32` tensor.
    Tensor,
    /// `i32` index tensor.
    Index,
    /// Integer scalar.
    Int,
    /// Integer vector.
    Vector,
}

impl fmt::Display for ArgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tensor => "tensor",
            Self::Index => "index",
            Self::Int => "int",
            Self::Vector => "vector",
        })
    }
}

/// One positional kernel argument, borrowed from the host.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// `f32` tensor.
    Tensor(&'a Tensor<f32>),
    /// `i32` index tensor.
    Index(&'a Tensor<i32>),
    /// Integer scalar.
    Int(i64),
    /// Integer vector.
    Vector(&'a [i64]),
}

impl KernelArg<'_> {
    /// Kind of this argument.
    pub const fn kind(&self) -> ArgKind {
        match self {
            Self::Tensor(_) => ArgKind::Tensor,
            Self::Index(_) => ArgKind::Index,
            Self::Int(_) => ArgKind::Int,
            Self::Vector(_) => ArgKind::Vector,
        }
    }
}

/// Host launcher bound to a kernel name.
pub type KernelFn = fn(&TileGroup, &[KernelArg<'_>]) -> Result<()>;

/// A registered kernel.
#[derive(Clone, Copy)]
pub struct KernelEntry {
    /// Stable kernel name.
    pub name: &'static str,
    /// Positional argument kinds.
    pub signature: &'static [ArgKind],
    launch: KernelFn,
}

impl KernelEntry {
    /// Entry for `launch` under `name`.
    pub const fn new(name: &'static str, signature: &'static [ArgKind], launch: KernelFn) -> Self {
        Self { name, signature, launch }
    }

    /// Check `args` against the signature.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Signature`] on a count or kind mismatch.
    pub fn check(&self, args: &[KernelArg<'_>]) -> Result<()> {
        if args.len() != self.signature.len() {
            return Err(KernelError::signature(
                self.name,
                format!("expected {} arguments, got {}", self.signature.len(), args.len()),
            ));
        }
        for (i, (arg, &kind)) in args.iter().zip(self.signature).enumerate() {
            if arg.kind() != kind {
                return Err(KernelError::signature(
                    self.name,
                    format!("argument {i} should be {kind}, got {}", arg.kind()),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelEntry")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<String> = self.signature.iter().map(ToString::to_string).collect();
        write!(f, "{}({})", self.name, kinds.join(", "))
    }
}

/// Kernel name → entry table.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<KernelEntry>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in kernels.
    pub fn builtin() -> Self {
        Self { entries: BUILTIN.to_vec() }
    }

    /// Add an entry.
    ///
    /// # Errors
    ///
    /// Returns error if the name is already taken.
    pub fn register(&mut self, entry: KernelEntry) -> Result<()> {
        if self.get(entry.name).is_some() {
            return Err(KernelError::config(format!("kernel {} is already registered", entry.name)));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Entry registered under `name`.
    pub fn get(&self, name: &str) -> Option<&KernelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// All entries, in registration order.
    pub fn entries(&self) -> &[KernelEntry] {
        &self.entries
    }

    /// Run kernel `name` on every tile of `group`.
    ///
    /// Returns [`STATUS_OK`] on success; every failure is fatal for the
    /// invocation and comes back as an error.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown name, a signature mismatch, or any
    /// kernel failure.
    pub fn invoke(&self, name: &str, group: &TileGroup, args: &[KernelArg<'_>]) -> Result<i32> {
        let entry = self
            .get(name)
            .ok_or_else(|| KernelError::UnknownKernel { name: name.to_string() })?;
        entry.check(args)?;
        debug!("Invoking {} on {} group", entry, group.dims());
        (entry.launch)(group, args)?;
        Ok(STATUS_OK)
    }
}

const EYERISS_SIG: &[ArgKind] =
    &[ArgKind::Tensor, ArgKind::Tensor, ArgKind::Tensor, ArgKind::Vector, ArgKind::Vector];
const INDEX_ADD_SIG: &[ArgKind] = &[
    ArgKind::Tensor,
    ArgKind::Tensor,
    ArgKind::Index,
    ArgKind::Int,
    ArgKind::Int,
    ArgKind::Int,
    ArgKind::Int,
];
const MM_SIG: &[ArgKind] = &[ArgKind::Tensor, ArgKind::Tensor, ArgKind::Tensor];

const BUILTIN: [KernelEntry; 3] = [
    KernelEntry::new("tensorlib_eyeriss", EYERISS_SIG, launch_eyeriss),
    KernelEntry::new("tensorlib_index_add", INDEX_ADD_SIG, launch_index_add),
    KernelEntry::new("tensorlib_mm", MM_SIG, launch_mm),
];

/// Typed view of a checked argument list.
struct Args<'s, 'a> {
    name: &'static str,
    args: &'s [KernelArg<'a>],
}

impl<'a> Args<'_, 'a> {
    fn mismatch(&self, i: usize) -> KernelError {
        KernelError::signature(self.name, format!("argument {i} has the wrong kind"))
    }

    fn tensor(&self, i: usize) -> Result<&'a Tensor<f32>> {
        match self.args.get(i) {
            Some(&KernelArg::Tensor(t)) => Ok(t),
            _ => Err(self.mismatch(i)),
        }
    }

    fn index(&self, i: usize) -> Result<&'a Tensor<i32>> {
        match self.args.get(i) {
            Some(&KernelArg::Index(t)) => Ok(t),
            _ => Err(self.mismatch(i)),
        }
    }

    fn count(&self, i: usize) -> Result<usize> {
        match self.args.get(i) {
            Some(&KernelArg::Int(v)) => usize::try_from(v).map_err(|_| {
                KernelError::signature(self.name, format!("argument {i} must be non-negative, got {v}"))
            }),
            _ => Err(self.mismatch(i)),
        }
    }

    fn vector(&self, i: usize) -> Result<&'a [i64]> {
        match self.args.get(i) {
            Some(&KernelArg::Vector(v)) => Ok(v),
            _ => Err(self.mismatch(i)),
        }
    }
}

fn launch_eyeriss(group: &TileGroup, args: &[KernelArg<'_>]) -> Result<()> {
    let a = Args { name: "tensorlib_eyeriss", args };
    let config = EyerissConfig::for_dims(group.dims())?;
    eyeriss::eyeriss(group, &config, a.tensor(0)?, a.tensor(1)?, a.tensor(2)?, a.vector(3)?, a.vector(4)?)
}

fn launch_index_add(group: &TileGroup, args: &[KernelArg<'_>]) -> Result<()> {
    let a = Args { name: "tensorlib_index_add", args };
    index_add::index_add(
        group,
        &IndexAddConfig::default(),
        a.tensor(0)?,
        a.tensor(1)?,
        a.index(2)?,
        a.count(3)?,
        a.count(4)?,
        a.count(5)?,
        a.count(6)?,
    )
}

fn launch_mm(group: &TileGroup, args: &[KernelArg<'_>]) -> Result<()> {
    let a = Args { name: "tensorlib_mm", args };
    mm::mm(group, a.tensor(0)?, a.tensor(1)?, a.tensor(2)?)
}
