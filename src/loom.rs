pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(unused_imports)]

    pub(crate) mod atomic {
        pub use core::sync::atomic::Ordering;
        pub use loom::sync::atomic::*;
    }

    pub(crate) use loom::{hint, model, sync, thread};

    pub(crate) mod alloc {
        pub(crate) use loom::alloc::Track;
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code)]
    pub(crate) mod sync {
        pub(crate) use alloc::sync::Arc;
        pub(crate) use core::sync::atomic;
    }

    pub(crate) mod hint {
        #[inline(always)]
        pub(crate) fn spin_loop() {
            core::hint::spin_loop()
        }
    }

    #[cfg(test)]
    pub(crate) fn model(f: impl FnOnce()) {
        let collector = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .without_time()
            .with_thread_ids(true)
            .with_thread_names(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(collector);
        f()
    }
}
