use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Positional access to the backing store of an image.
pub trait BlockSource {
    /// Total size of the backing store in bytes.
    fn size(&mut self) -> io::Result<u64>;
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    /// Makes previous writes durable.
    fn sync(&mut self) -> io::Result<()>;
}

impl BlockSource for File {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl BlockSource for Cursor<Vec<u8>> {
    fn size(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.set_position(offset);
        self.read_exact(buf)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.set_position(offset);
        self.write_all(buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: BlockSource + ?Sized> BlockSource for &mut T {
    fn size(&mut self) -> io::Result<u64> {
        (**self).size()
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read_exact_at(buf, offset)
    }

    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        (**self).write_all_at(buf, offset)
    }

    fn sync(&mut self) -> io::Result<()> {
        (**self).sync()
    }
}
