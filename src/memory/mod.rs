pub(crate) mod arena;
pub(crate) mod block;
pub(crate) mod region;
pub(crate) mod segment;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
