//! Userdata: opaque host payloads with a type descriptor.
//!
//! The descriptor doubles as the GC hook table: the optional mark callback
//! lets a payload keep interior `Value`s alive, and the optional finalizer
//! runs during sweep before the block is freed.

use std::any::Any;
use std::cell::RefCell;

use crate::gc::Heap;

/// Descriptor registered by the embedder, one static per host type.
pub struct UserType {
    pub name: &'static str,
    /// Runs during sweep, before the payload is dropped.
    pub finalize: Option<fn(&mut dyn Any)>,
    /// Marks interior values during the mark phase.
    pub mark: Option<fn(&Heap, &dyn Any)>,
}

pub struct Userdata {
    pub utype: &'static UserType,
    pub data: RefCell<Box<dyn Any>>,
}

impl Userdata {
    pub fn new(utype: &'static UserType, data: Box<dyn Any>) -> Userdata {
        Userdata {
            utype,
            data: RefCell::new(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PLAIN: UserType = UserType {
        name: "plain",
        finalize: None,
        mark: None,
    };

    #[test]
    fn test_payload_downcast() {
        let ud = Userdata::new(&PLAIN, Box::new(42i64));
        let data = ud.data.borrow();
        assert_eq!(data.downcast_ref::<i64>(), Some(&42));
        assert_eq!(ud.utype.name, "plain");
    }
}
