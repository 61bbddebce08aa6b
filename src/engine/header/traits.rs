/// Trait for headers that span a known number of 512-byte blocks.
pub trait UsedBlocksTrait {
    /// Calculates the number of blocks the header uses once saved,
    /// including long name records and extended sparse blocks.
    fn calc_used_blocks(&self) -> usize;
}

/// Trait for entry kinds.
pub trait IsTypeTrait {
    // Tells if the entry is a regular file (sparse files included).
    fn is_regular_file(&self) -> bool;
    // Tells if the entry is a hard link.
    fn is_hard_link(&self) -> bool;
    // Tells if the entry is a symbolic link.
    fn is_symbolic_link(&self) -> bool;
    // Tells if the entry is a character special file.
    fn is_character_special(&self) -> bool;
    // Tells if the entry is a block special file.
    fn is_block_special(&self) -> bool;
    // Tells if the entry is a directory.
    fn is_directory(&self) -> bool;
    // Tells if the entry is a FIFO.
    fn is_fifo(&self) -> bool;
    // Tells if the entry is a GNU sparse file.
    fn is_sparse(&self) -> bool;
}
