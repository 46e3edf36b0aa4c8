use crate::rtl::DeviceAddr;
use crate::utils::WORD_SIZE;

/// Kernel argument rewriting for address-translate mode.
///
/// Rewritten kernels take the translation table as two extra arguments. Until launch the
/// compiler passes placeholders for them: a pointer argument whose byte size equals
/// `fake_table_byte`, and a literal whose value equals `fake_table_size`. Both are swapped
/// for the real table here. Without placeholders nothing is rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableArgs {
    pub fake_table_size: Option<usize>,
    pub fake_table_byte: Option<usize>,
    /// Rows of the current table, header included.
    pub table_size: usize,
    pub table: DeviceAddr,
}

impl TableArgs {
    #[must_use]
    pub const fn new(fake_table_size: usize, fake_table_byte: usize) -> Self {
        Self {
            fake_table_size: Some(fake_table_size),
            fake_table_byte: Some(fake_table_byte),
            table_size: 0,
            table: 0,
        }
    }

    pub const fn set_placeholders(&mut self, fake_table_size: usize, fake_table_byte: usize) {
        self.fake_table_size = Some(fake_table_size);
        self.fake_table_byte = Some(fake_table_byte);
    }

    pub const fn set_table(&mut self, table: DeviceAddr, table_size: usize) {
        self.table = table;
        self.table_size = table_size;
    }

    /// A pointer argument of `size` bytes: the table placeholder becomes the table.
    #[must_use]
    pub fn pass_arg(&self, addr: usize, size: usize) -> usize {
        if Some(size) == self.fake_table_byte {
            log::debug!("Replaced table argument {addr:#x} with {:#x}", self.table);
            self.table
        } else {
            addr
        }
    }

    /// A literal argument of `size` bytes: the size placeholder becomes the row count.
    /// Only the low `size` bytes of the literal are compared.
    #[must_use]
    pub fn pass_literal(&self, literal: usize, size: usize) -> usize {
        let mask = if size < WORD_SIZE {
            (1usize << (size * 8)) - 1
        } else {
            usize::MAX
        };
        let value = literal & mask;
        if Some(value) == self.fake_table_size {
            log::debug!(
                "Replaced table size argument {value} with {}",
                self.table_size
            );
            self.table_size
        } else {
            literal
        }
    }
}
