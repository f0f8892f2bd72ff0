//! Version edits: deltas applied to the live table layout and logged to the
//! manifest.
//!
//! Each field is encoded as a tag byte followed by its payload, so old
//! readers can reject unknown tags outright and absent fields cost nothing:
//!
//! ```text
//! +-----+---------+ +-----+---------+ ...
//! | tag | payload | | tag | payload |
//! +-----+---------+ +-----+---------+
//! ```

use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::error::{Error, Result};

const TAG_COMPARATOR: u8 = 0x01;
const TAG_JOURNAL_NUM: u8 = 0x02;
const TAG_PREV_JOURNAL_NUM: u8 = 0x03;
const TAG_NEXT_FILE_NUM: u8 = 0x04;
const TAG_LAST_SEQ: u8 = 0x05;
const TAG_COMPACTION_POINTER: u8 = 0x06;
const TAG_DELETED_FILE: u8 = 0x07;
const TAG_NEW_FILE: u8 = 0x08;

/// A table added to a level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewFile {
    pub level: usize,
    pub num: u64,
    pub size: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
}

/// A delta against the current version. Applying it produces the next
/// version; appending it to the manifest makes that transition durable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionEdit {
    pub comparator_name: Option<String>,
    pub journal_num: Option<u64>,
    pub prev_journal_num: Option<u64>,
    pub next_file_num: Option<u64>,
    pub last_seq: Option<u64>,
    pub compaction_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<NewFile>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_comparator_name(&mut self, name: &str) {
        self.comparator_name = Some(name.to_string());
    }

    pub fn set_journal_num(&mut self, num: u64) {
        self.journal_num = Some(num);
    }

    pub fn set_prev_journal_num(&mut self, num: u64) {
        self.prev_journal_num = Some(num);
    }

    pub fn set_next_file_num(&mut self, num: u64) {
        self.next_file_num = Some(num);
    }

    pub fn set_last_seq(&mut self, seq: u64) {
        self.last_seq = Some(seq);
    }

    pub fn set_compaction_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compaction_pointers.push((level, key));
    }

    pub fn add_file(
        &mut self,
        level: usize,
        num: u64,
        size: u64,
        smallest: Vec<u8>,
        largest: Vec<u8>,
    ) {
        self.new_files.push(NewFile {
            level,
            num,
            size,
            smallest,
            largest,
        });
    }

    pub fn delete_file(&mut self, level: usize, num: u64) {
        self.deleted_files.push((level, num));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(name) = &self.comparator_name {
            buf.write_u8(TAG_COMPARATOR).unwrap();
            write_bytes(&mut buf, name.as_bytes());
        }
        if let Some(num) = self.journal_num {
            buf.write_u8(TAG_JOURNAL_NUM).unwrap();
            buf.write_u64::<BigEndian>(num).unwrap();
        }
        if let Some(num) = self.prev_journal_num {
            buf.write_u8(TAG_PREV_JOURNAL_NUM).unwrap();
            buf.write_u64::<BigEndian>(num).unwrap();
        }
        if let Some(num) = self.next_file_num {
            buf.write_u8(TAG_NEXT_FILE_NUM).unwrap();
            buf.write_u64::<BigEndian>(num).unwrap();
        }
        if let Some(seq) = self.last_seq {
            buf.write_u8(TAG_LAST_SEQ).unwrap();
            buf.write_u64::<BigEndian>(seq).unwrap();
        }
        for (level, key) in &self.compaction_pointers {
            buf.write_u8(TAG_COMPACTION_POINTER).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            write_bytes(&mut buf, key);
        }
        for (level, num) in &self.deleted_files {
            buf.write_u8(TAG_DELETED_FILE).unwrap();
            buf.write_u32::<BigEndian>(*level as u32).unwrap();
            buf.write_u64::<BigEndian>(*num).unwrap();
        }
        for file in &self.new_files {
            buf.write_u8(TAG_NEW_FILE).unwrap();
            buf.write_u32::<BigEndian>(file.level as u32).unwrap();
            buf.write_u64::<BigEndian>(file.num).unwrap();
            buf.write_u64::<BigEndian>(file.size).unwrap();
            write_bytes(&mut buf, &file.smallest);
            write_bytes(&mut buf, &file.largest);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut edit = VersionEdit::default();
        loop {
            let tag = match cursor.read_u8() {
                Ok(tag) => tag,
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            match tag {
                TAG_COMPARATOR => {
                    let bytes = read_bytes(&mut cursor)?;
                    let name = String::from_utf8(bytes).map_err(|_| {
                        Error::Corruption("comparator name is not utf-8".into())
                    })?;
                    edit.comparator_name = Some(name);
                }
                TAG_JOURNAL_NUM => edit.journal_num = Some(cursor.read_u64::<BigEndian>()?),
                TAG_PREV_JOURNAL_NUM => {
                    edit.prev_journal_num = Some(cursor.read_u64::<BigEndian>()?)
                }
                TAG_NEXT_FILE_NUM => edit.next_file_num = Some(cursor.read_u64::<BigEndian>()?),
                TAG_LAST_SEQ => edit.last_seq = Some(cursor.read_u64::<BigEndian>()?),
                TAG_COMPACTION_POINTER => {
                    let level = cursor.read_u32::<BigEndian>()? as usize;
                    let key = read_bytes(&mut cursor)?;
                    edit.compaction_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = cursor.read_u32::<BigEndian>()? as usize;
                    let num = cursor.read_u64::<BigEndian>()?;
                    edit.deleted_files.push((level, num));
                }
                TAG_NEW_FILE => {
                    let level = cursor.read_u32::<BigEndian>()? as usize;
                    let num = cursor.read_u64::<BigEndian>()?;
                    let size = cursor.read_u64::<BigEndian>()?;
                    let smallest = read_bytes(&mut cursor)?;
                    let largest = read_bytes(&mut cursor)?;
                    edit.new_files.push(NewFile {
                        level,
                        num,
                        size,
                        smallest,
                        largest,
                    });
                }
                _ => {
                    return Err(Error::Corruption(format!(
                        "unknown version edit tag: {tag}"
                    )))
                }
            }
        }
        Ok(edit)
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, bytes.len() as u32);
    buf.extend_from_slice(&len);
    buf.extend_from_slice(bytes);
}

fn read_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<BigEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(Error::Corruption(format!(
            "byte string of {len} bytes with {remaining} remaining"
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_edit() -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("silt.BytewiseComparator");
        edit.set_journal_num(12);
        edit.set_prev_journal_num(0);
        edit.set_next_file_num(14);
        edit.set_last_seq(9001);
        edit.set_compaction_pointer(1, b"pointer-key".to_vec());
        edit.delete_file(0, 7);
        edit.delete_file(0, 8);
        edit.add_file(1, 13, 4096, b"aaa".to_vec(), b"zzz".to_vec());
        edit
    }

    #[test]
    fn test_roundtrip_full_edit() {
        let edit = sample_edit();
        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn test_roundtrip_empty_edit() {
        let edit = VersionEdit::new();
        assert!(edit.encode().is_empty());
        assert_eq!(VersionEdit::decode(&[]).unwrap(), edit);
    }

    #[test]
    fn test_roundtrip_partial_fields() {
        let mut edit = VersionEdit::new();
        edit.set_last_seq(1);
        edit.add_file(0, 2, 333, b"".to_vec(), b"\xff\xff".to_vec());
        let decoded = VersionEdit::decode(&edit.encode()).unwrap();
        assert_eq!(decoded, edit);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let result = VersionEdit::decode(&[0xEE]);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let edit = sample_edit();
        let encoded = edit.encode();
        assert!(VersionEdit::decode(&encoded[..encoded.len() - 2]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_byte_string() {
        let mut data = vec![TAG_COMPARATOR];
        data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        data.extend_from_slice(b"abc");
        assert!(VersionEdit::decode(&data).is_err());
    }
}
