//! File and path-name layer consumed by process creation and teardown.

/// Reference-counted file and inode handles.
///
/// Handles are move-only: every handle obtained from `file_dup`,
/// `namei` or `inode_dup` is given back exactly once through
/// `file_close` or `inode_put`.
pub trait FileSystem {
    type File: Send;
    type Inode: Send;

    /// One-time initialization that must run in process context. Called
    /// by the first process to be scheduled.
    fn init(&self) {}

    fn file_dup(&self, file: &Self::File) -> Self::File;
    fn file_close(&self, file: Self::File);

    fn namei(&self, path: &str) -> Option<Self::Inode>;
    fn inode_dup(&self, inode: &Self::Inode) -> Self::Inode;
    fn inode_put(&self, inode: Self::Inode);

    /// Log transaction bracketing inode releases.
    fn begin_op(&self);
    fn end_op(&self);
}
