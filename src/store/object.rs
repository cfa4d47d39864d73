//! The application contract and shared object handles

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use crate::file::ObjAddr;
use crate::index::{KeySpec, KeyValue};

use super::error::StoreResult;
use super::stream::{ObjectReader, ObjectWriter};

/// A class of storable objects.
///
/// The pairing of `read` and `write` is the entire schema: both must issue
/// the same sequence of stream calls. `key_values` returns one value per
/// declared spec, in declaration order; a key whose bytes are all zero is
/// null and stays out of its index.
pub trait Persistent: Sized + 'static {
    /// Stable name recorded on disk; renaming it orphans stored objects
    fn class_name() -> &'static str;

    fn key_specs() -> Vec<KeySpec>;

    fn key_values(&self) -> Vec<KeyValue>;

    fn read(&mut self, reader: &mut ObjectReader<'_>) -> StoreResult<()>;

    fn write(&self, writer: &mut ObjectWriter<'_>) -> StoreResult<()>;
}

/// Lifecycle of a tracked object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectState {
    /// Allocated this session, not yet written out
    New,
    /// Loaded and unmodified since
    Clean,
    /// Loaded and flagged for rewrite
    Dirty,
    /// Flagged for removal at flush
    Deleted,
}

/// Object-safe view the engine keeps of any stored object
pub(crate) trait ErasedObject: Any {
    fn key_values(&self) -> Vec<KeyValue>;
    fn write_payload(&self, writer: &mut ObjectWriter<'_>) -> StoreResult<()>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Persistent> ErasedObject for T {
    fn key_values(&self) -> Vec<KeyValue> {
        Persistent::key_values(self)
    }

    fn write_payload(&self, writer: &mut ObjectWriter<'_>) -> StoreResult<()> {
        self.write(writer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) type SharedObject = Rc<RefCell<dyn ErasedObject>>;
pub(crate) type WeakObject = Weak<RefCell<dyn ErasedObject>>;

/// Shared handle to a live object.
///
/// All handles to the same object address alias one instance; cloning a
/// handle is cheap and keeps the instance alive. The engine holds a weak
/// reference (plus a strong one while unflushed work is pending), so an
/// instance dies when the application drops its last handle and nothing
/// remains to write.
pub struct ObjRef<T: Persistent> {
    pub(crate) object: SharedObject,
    pub(crate) addr: ObjAddr,
    _marker: PhantomData<T>,
}

impl<T: Persistent> ObjRef<T> {
    /// Caller attests that the erased object really is a `T`
    pub(crate) fn new(object: SharedObject, addr: ObjAddr) -> Self {
        debug_assert!(object.borrow().as_any().is::<T>());
        Self {
            object,
            addr,
            _marker: PhantomData,
        }
    }

    /// The object's address: the node number of its first data-file node
    pub fn address(&self) -> ObjAddr {
        self.addr
    }

    pub fn borrow(&self) -> Ref<'_, T> {
        Ref::map(self.object.borrow(), |obj| {
            obj.as_any()
                .downcast_ref::<T>()
                .expect("handle class verified at materialization")
        })
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        RefMut::map(self.object.borrow_mut(), |obj| {
            obj.as_any_mut()
                .downcast_mut::<T>()
                .expect("handle class verified at materialization")
        })
    }
}

impl<T: Persistent> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        Self {
            object: Rc::clone(&self.object),
            addr: self.addr,
            _marker: PhantomData,
        }
    }
}
