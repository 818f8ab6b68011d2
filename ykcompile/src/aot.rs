//! Process-wide AOT module state.
//!
//! The serialised AOT module is registered once per process (the embedder
//! digs it out of the running binary). Each compilation thread then decodes
//! its own copy on first use, since modules cannot be shared across threads
//! while compilations run in parallel.

use fallible_iterator::FallibleIterator;
use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use ykir::{Decoder, Module, Pack};

lazy_static! {
    static ref AOT_IMAGE: Mutex<Option<Arc<Vec<u8>>>> = Mutex::new(None);
}

thread_local! {
    static THREAD_AOT_MOD: RefCell<Option<Rc<Module>>> = RefCell::new(None);
}

/// Register the serialised AOT module for this process. The first
/// registration wins; later calls are ignored.
pub fn register_aot_image(image: Vec<u8>) {
    let mut guard = AOT_IMAGE.lock().unwrap();
    if guard.is_none() {
        *guard = Some(Arc::new(image));
    }
}

/// Run `f` against this thread's copy of the AOT module, decoding the
/// registered image on the thread's first use. Returns `None` when no image
/// has been registered.
pub fn with_thread_aot_module<R>(f: impl FnOnce(&Module) -> R) -> Option<R> {
    THREAD_AOT_MOD.with(|cell| {
        let mut opt = cell.borrow_mut();
        if opt.is_none() {
            let image = AOT_IMAGE.lock().unwrap().clone()?;
            let mut curs = Cursor::new(&image[..]);
            let mut dec = Decoder::from(&mut curs);
            let pack = dec
                .next()
                .expect("can't load AOT module")
                .expect("AOT image is empty");
            let Pack::Module(m) = pack;
            *opt = Some(Rc::new(m));
        }
        Some(f(opt.as_ref().unwrap()))
    })
}
