//! Point record decoding for the four supported record formats.
//!
//! Formats differ in the presence of a GPS timestamp and/or RGB colour and
//! therefore in record size. Raw positions are 32-bit signed little-endian
//! integers; the true coordinate is `raw * scale + offset` using the owning
//! file's per-axis scale and offset.
//!
//! Colour channels are transmitted as two bytes each, but the two producer
//! tools observed for formats 2 and 3 disagree on which byte comes first.
//! Each variant keeps its own documented byte order rather than assuming
//! symmetry; in both cases only the low 8 bits of the reconstructed value
//! carry the visible intensity.
use std::io::{ErrorKind, Read, Seek, SeekFrom};

use crate::error::{IndexError, IndexResult};
use crate::header::LasHeader;

/// Record format selector from the file header. The set is closed, so the
/// selector is an enum rather than a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointFormat {
    /// Position, intensity, classification. 20 bytes.
    Format0,
    /// Format 0 plus a GPS timestamp. 28 bytes.
    Format1,
    /// Format 0 plus RGB colour. 26 bytes.
    Format2,
    /// Format 0 plus GPS timestamp and RGB colour. 34 bytes.
    Format3,
}

impl PointFormat {
    pub fn from_id(id: u8) -> IndexResult<Self> {
        match id {
            0 => Ok(Self::Format0),
            1 => Ok(Self::Format1),
            2 => Ok(Self::Format2),
            3 => Ok(Self::Format3),
            other => Err(IndexError::UnsupportedRecordFormat(other)),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Self::Format0 => 0,
            Self::Format1 => 1,
            Self::Format2 => 2,
            Self::Format3 => 3,
        }
    }

    /// Nominal record size in bytes.
    pub fn record_size(self) -> usize {
        match self {
            Self::Format0 => 20,
            Self::Format1 => 28,
            Self::Format2 => 26,
            Self::Format3 => 34,
        }
    }

    pub fn has_gps_time(self) -> bool {
        matches!(self, Self::Format1 | Self::Format3)
    }

    pub fn has_colour(self) -> bool {
        matches!(self, Self::Format2 | Self::Format3)
    }

    /// Byte offset of the six-byte RGB block within a record.
    fn colour_offset(self) -> Option<usize> {
        match self {
            Self::Format2 => Some(20),
            Self::Format3 => Some(28),
            _ => None,
        }
    }
}

/// One decoded point: true world position (after scale/offset, before
/// normalisation) and optional colour in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodedPoint {
    pub position: (f64, f64, f64),
    pub colour: Option<(f32, f32, f32)>,
}

/// Decoder for one file's records, carrying the scale/offset context from
/// that file's header.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    format: PointFormat,
    scale: (f64, f64, f64),
    offset: (f64, f64, f64),
}

impl RecordDecoder {
    pub fn for_header(header: &LasHeader) -> Self {
        Self {
            format: header.point_format,
            scale: header.scale,
            offset: header.offset,
        }
    }

    pub fn format(&self) -> PointFormat {
        self.format
    }

    /// Decode one raw record. `raw` must hold at least the format's nominal
    /// record size.
    pub fn decode(&self, raw: &[u8]) -> DecodedPoint {
        let raw_x = i32::from_le_bytes(raw[0..4].try_into().unwrap()) as f64;
        let raw_y = i32::from_le_bytes(raw[4..8].try_into().unwrap()) as f64;
        let raw_z = i32::from_le_bytes(raw[8..12].try_into().unwrap()) as f64;

        let position = (
            raw_x * self.scale.0 + self.offset.0,
            raw_y * self.scale.1 + self.offset.1,
            raw_z * self.scale.2 + self.offset.2,
        );

        let colour = self.format.colour_offset().map(|at| {
            (
                decode_channel(self.format, [raw[at], raw[at + 1]]),
                decode_channel(self.format, [raw[at + 2], raw[at + 3]]),
                decode_channel(self.format, [raw[at + 4], raw[at + 5]]),
            )
        });

        DecodedPoint { position, colour }
    }
}

/// Reconstruct one 16-bit colour channel and rescale its low byte to [0, 1].
///
/// Format 2 producers transmit the low byte first (little-endian); format 3
/// producers transmit the high byte first. Verified against sample files,
/// not unified.
fn decode_channel(format: PointFormat, bytes: [u8; 2]) -> f32 {
    let value = match format {
        PointFormat::Format2 => u16::from_le_bytes(bytes),
        PointFormat::Format3 => u16::from_be_bytes(bytes),
        _ => 0,
    };
    (value & 0x00FF) as f32 / 255.0
}

/// Streaming, decimating iterator over one file's point records.
///
/// Only every `(skip + 1)`-th record is decoded and emitted; intervening
/// records are skipped with an O(1) seek since records are fixed-size. The
/// final record of the file is always emitted so decimation never shortens
/// the spatial extent of the trace.
pub struct RecordStream<R: Read + Seek> {
    reader: R,
    decoder: RecordDecoder,
    record_size: usize,
    stride: u64,
    record_count: u64,
    period: u64,
    /// Next emission index that is a multiple of the period.
    next_multiple: u64,
    /// Reader position in bytes, relative to the first record.
    byte_pos: u64,
    emitted: u64,
    tail_done: bool,
    failed: bool,
}

impl<R: Read + Seek> RecordStream<R> {
    /// Position `reader` at the file's first point record and prepare a
    /// decimating stream over all of its records.
    pub fn new(mut reader: R, header: &LasHeader, skip: u32) -> IndexResult<Self> {
        reader.seek(SeekFrom::Start(header.offset_to_point_data as u64))?;
        Ok(Self {
            reader,
            decoder: RecordDecoder::for_header(header),
            record_size: header.point_format.record_size(),
            stride: header.record_stride(),
            record_count: header.record_count as u64,
            period: skip as u64 + 1,
            next_multiple: 0,
            byte_pos: 0,
            emitted: 0,
            tail_done: false,
            failed: false,
        })
    }

    /// Number of points emitted so far. Meaningful after a fault as well:
    /// a truncated file reports how far decoding got.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Index of the next record to emit, or None when the stream is done.
    fn next_emit_index(&mut self) -> Option<u64> {
        if self.next_multiple < self.record_count {
            let index = self.next_multiple;
            self.next_multiple += self.period;
            return Some(index);
        }
        let last = self.record_count.checked_sub(1)?;
        if !self.tail_done && last % self.period != 0 {
            self.tail_done = true;
            return Some(last);
        }
        None
    }

    fn read_record(&mut self, index: u64) -> IndexResult<DecodedPoint> {
        let target = index * self.stride;
        if target != self.byte_pos {
            self.reader
                .seek(SeekFrom::Current((target - self.byte_pos) as i64))?;
            self.byte_pos = target;
        }

        // Largest record variant is 34 bytes (format 3).
        let mut raw = [0u8; 34];
        let raw = &mut raw[..self.record_size];
        self.reader.read_exact(raw).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                IndexError::TruncatedRecord {
                    emitted: self.emitted,
                }
            } else {
                IndexError::Io(err)
            }
        })?;
        self.byte_pos += self.record_size as u64;

        Ok(self.decoder.decode(raw))
    }
}

impl<R: Read + Seek> Iterator for RecordStream<R> {
    type Item = IndexResult<DecodedPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let index = self.next_emit_index()?;
        match self.read_record(index) {
            Ok(point) => {
                self.emitted += 1;
                Some(Ok(point))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::header::tests::encode_header;
    use crate::header::LasHeader;
    use std::io::Cursor;

    /// Encode one raw record for the given format.
    pub(crate) fn encode_record(
        format: PointFormat,
        raw_pos: (i32, i32, i32),
        rgb: Option<[[u8; 2]; 3]>,
    ) -> Vec<u8> {
        let mut record = vec![0u8; format.record_size()];
        record[0..4].copy_from_slice(&raw_pos.0.to_le_bytes());
        record[4..8].copy_from_slice(&raw_pos.1.to_le_bytes());
        record[8..12].copy_from_slice(&raw_pos.2.to_le_bytes());
        if let (Some(channels), Some(at)) = (rgb, format.colour_offset()) {
            for (i, channel) in channels.iter().enumerate() {
                record[at + i * 2..at + i * 2 + 2].copy_from_slice(channel);
            }
        }
        record
    }

    /// Assemble a complete in-memory file: header plus `records`.
    pub(crate) fn encode_file(header_block: &[u8], records: &[Vec<u8>]) -> Vec<u8> {
        let mut file = header_block.to_vec();
        for record in records {
            file.extend_from_slice(record);
        }
        file
    }

    fn header_for(format_id: u8, record_count: u32) -> LasHeader {
        let block = encode_header(
            format_id,
            record_count,
            (0.01, 0.01, 0.01),
            (10.0, 20.0, 30.0),
            (-500.0, -500.0, -500.0),
            (500.0, 500.0, 500.0),
        );
        LasHeader::parse(&block).unwrap()
    }

    #[test]
    fn record_sizes_match_format() {
        assert_eq!(PointFormat::Format0.record_size(), 20);
        assert_eq!(PointFormat::Format1.record_size(), 28);
        assert_eq!(PointFormat::Format2.record_size(), 26);
        assert_eq!(PointFormat::Format3.record_size(), 34);
    }

    #[test]
    fn decode_applies_scale_and_offset() {
        let header = header_for(0, 1);
        let decoder = RecordDecoder::for_header(&header);
        let raw = encode_record(PointFormat::Format0, (100, -200, 300), None);
        let point = decoder.decode(&raw);
        assert_eq!(point.position, (11.0, 18.0, 33.0));
        assert_eq!(point.colour, None);
    }

    #[test]
    fn format2_colour_is_little_endian() {
        let header = header_for(2, 1);
        let decoder = RecordDecoder::for_header(&header);
        // First transmitted byte is the low byte: 0x12 is the intensity.
        let raw = encode_record(
            PointFormat::Format2,
            (0, 0, 0),
            Some([[0x12, 0x34], [0xFF, 0x00], [0x00, 0xAB]]),
        );
        let colour = decoder.decode(&raw).colour.unwrap();
        assert!((colour.0 - 0x12 as f32 / 255.0).abs() < 1e-6);
        assert!((colour.1 - 1.0).abs() < 1e-6);
        assert!((colour.2 - 0.0).abs() < 1e-6);
    }

    #[test]
    fn format3_colour_is_big_endian() {
        let header = header_for(3, 1);
        let decoder = RecordDecoder::for_header(&header);
        // First transmitted byte is the high byte: 0x34 is the intensity.
        let raw = encode_record(
            PointFormat::Format3,
            (0, 0, 0),
            Some([[0x12, 0x34], [0x00, 0xFF], [0xAB, 0x00]]),
        );
        let colour = decoder.decode(&raw).colour.unwrap();
        assert!((colour.0 - 0x34 as f32 / 255.0).abs() < 1e-6);
        assert!((colour.1 - 1.0).abs() < 1e-6);
        assert!((colour.2 - 0.0).abs() < 1e-6);
    }

    #[test]
    fn decimation_emits_every_tenth_record_plus_tail() {
        let record_count = 100u32;
        let header = header_for(1, record_count);
        let records: Vec<Vec<u8>> = (0..record_count as i32)
            .map(|i| encode_record(PointFormat::Format1, (i, i, i), None))
            .collect();
        let file = encode_file(
            &encode_header(
                1,
                record_count,
                (0.01, 0.01, 0.01),
                (10.0, 20.0, 30.0),
                (-500.0, -500.0, -500.0),
                (500.0, 500.0, 500.0),
            ),
            &records,
        );

        let stream = RecordStream::new(Cursor::new(file), &header, 9).unwrap();
        let points: Vec<_> = stream.map(|p| p.unwrap()).collect();

        // Indices 0, 10, ..., 90 plus the final record 99.
        assert_eq!(points.len(), 11);
        assert_eq!(points[0].position.0, 10.0);
        assert_eq!(points[1].position.0, 10.0 + 10.0 * 0.01);
        assert_eq!(points[10].position.0, 10.0 + 99.0 * 0.01);
    }

    #[test]
    fn skip_zero_emits_every_record_once() {
        let record_count = 7u32;
        let header = header_for(0, record_count);
        let records: Vec<Vec<u8>> = (0..record_count as i32)
            .map(|i| encode_record(PointFormat::Format0, (i, 0, 0), None))
            .collect();
        let file = encode_file(
            &encode_header(
                0,
                record_count,
                (0.01, 0.01, 0.01),
                (10.0, 20.0, 30.0),
                (-500.0, -500.0, -500.0),
                (500.0, 500.0, 500.0),
            ),
            &records,
        );

        let stream = RecordStream::new(Cursor::new(file), &header, 0).unwrap();
        assert_eq!(stream.count(), 7);
    }

    #[test]
    fn truncated_file_reports_emitted_count() {
        let record_count = 10u32;
        let header = header_for(3, record_count);
        let records: Vec<Vec<u8>> = (0..record_count as i32)
            .map(|i| encode_record(PointFormat::Format3, (i, i, i), None))
            .collect();
        let mut file = encode_file(
            &encode_header(
                3,
                record_count,
                (0.01, 0.01, 0.01),
                (10.0, 20.0, 30.0),
                (-500.0, -500.0, -500.0),
                (500.0, 500.0, 500.0),
            ),
            &records,
        );
        // Chop the file mid-way through the sixth record.
        file.truncate(crate::header::HEADER_SIZE + 5 * 34 + 12);

        let mut stream = RecordStream::new(Cursor::new(file), &header, 0).unwrap();
        let mut decoded = 0u64;
        let fault = loop {
            match stream.next() {
                Some(Ok(_)) => decoded += 1,
                Some(Err(err)) => break err,
                None => panic!("expected a truncation fault"),
            }
        };
        assert_eq!(decoded, 5);
        assert!(matches!(
            fault,
            IndexError::TruncatedRecord { emitted: 5 }
        ));
        // The stream stops after the fault rather than zero-filling.
        assert!(stream.next().is_none());
    }
}
