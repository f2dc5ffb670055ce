use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use arrow::array::{new_empty_array, Array, ArrayRef};
use arrow::compute::concat;
use arrow::datatypes::{Field, Schema};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use crate::core::error::{Error, Result};
use crate::merge::ValueMerger;

/// One column decoded from a single-column Arrow IPC stream.
#[derive(Debug, Clone)]
pub struct DecodedColumn {
    pub field: Field,
    pub array: ArrayRef,
}

/// Encode `array` as a single-column Arrow IPC stream.
pub fn encode_column(field: &Field, array: ArrayRef) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![field.clone()]));
    let batch = RecordBatch::try_new(schema.clone(), vec![array])?;

    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, &schema)?;
        writer.write(&batch)?;
        writer.finish()?;
    }
    Ok(buf)
}

pub fn decode_column(data: &[u8]) -> Result<DecodedColumn> {
    let reader = StreamReader::try_new(Cursor::new(data), None)?;
    let field = single_field(&reader.schema())?;

    let mut arrays = Vec::new();
    for batch in reader {
        arrays.push(batch?.column(0).clone());
    }

    let array = match arrays.len() {
        0 => new_empty_array(field.data_type()),
        1 => arrays.remove(0),
        _ => concat_arrays(&arrays)?,
    };
    Ok(DecodedColumn { field, array })
}

/// Field of a columnar value, read from the stream header without decoding any rows.
pub fn decode_field(data: &[u8]) -> Result<Field> {
    let reader = StreamReader::try_new(Cursor::new(data), None)?;
    single_field(&reader.schema())
}

fn single_field(schema: &Schema) -> Result<Field> {
    if schema.fields().len() != 1 {
        return Err(Error::corruption(format!(
            "columnar value holds {} columns, expected 1",
            schema.fields().len()
        )));
    }
    Ok(schema.field(0).clone())
}

fn concat_arrays(arrays: &[ArrayRef]) -> Result<ArrayRef> {
    let refs: Vec<&dyn Array> = arrays.iter().map(|a| a.as_ref()).collect();
    Ok(concat(&refs)?)
}

/// Concatenates columnar operands in chronological order.
///
/// Operands arrive relative to what is already held: `merge_newer` appends,
/// `merge_older` prepends. Reordering would corrupt row order, so both
/// directions must be honoured exactly.
pub struct ColumnMerger {
    field: Field,
    arrays: VecDeque<ArrayRef>,
}

impl ColumnMerger {
    pub fn new(value: &[u8]) -> Result<Self> {
        let DecodedColumn { field, array } = decode_column(value)?;
        Ok(ColumnMerger {
            field,
            arrays: VecDeque::from([array]),
        })
    }

    fn decode_operand(&self, value: &[u8]) -> Result<ArrayRef> {
        let operand = decode_column(value)?;
        if operand.array.data_type() != self.field.data_type() {
            return Err(Error::corruption(format!(
                "column {}: cannot merge {} into {}",
                self.field.name(),
                operand.array.data_type(),
                self.field.data_type()
            )));
        }
        Ok(operand.array)
    }
}

impl ValueMerger for ColumnMerger {
    fn merge_newer(&mut self, value: &[u8]) -> Result<()> {
        let array = self.decode_operand(value)?;
        self.arrays.push_back(array);
        Ok(())
    }

    fn merge_older(&mut self, value: &[u8]) -> Result<()> {
        let array = self.decode_operand(value)?;
        self.arrays.push_front(array);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<Vec<u8>> {
        let ColumnMerger { field, arrays } = *self;
        let arrays: Vec<ArrayRef> = arrays.into_iter().collect();
        let array = match arrays.len() {
            1 => arrays[0].clone(),
            _ => concat_arrays(&arrays)?,
        };
        encode_column(&field, array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::UInt64Array;
    use arrow::datatypes::DataType;
    use crate::core::error::ErrorKind;

    fn operand(values: &[u64]) -> Vec<u8> {
        let field = Field::new("uid", DataType::UInt64, true);
        encode_column(&field, Arc::new(UInt64Array::from(values.to_vec()))).unwrap()
    }

    fn values(data: &[u8]) -> Vec<u64> {
        let column = decode_column(data).unwrap();
        let array = column.array.as_any().downcast_ref::<UInt64Array>().unwrap();
        array.values().to_vec()
    }

    #[test]
    fn newer_operands_append() {
        let mut merger: Box<dyn ValueMerger> = Box::new(ColumnMerger::new(&operand(&[1, 2])).unwrap());
        merger.merge_newer(&operand(&[3])).unwrap();
        merger.merge_newer(&operand(&[4, 5])).unwrap();
        assert_eq!(values(&merger.finish().unwrap()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn older_operands_prepend() {
        let mut merger: Box<dyn ValueMerger> = Box::new(ColumnMerger::new(&operand(&[4, 5])).unwrap());
        merger.merge_older(&operand(&[3])).unwrap();
        merger.merge_older(&operand(&[1, 2])).unwrap();
        assert_eq!(values(&merger.finish().unwrap()), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn mismatched_types_are_rejected() {
        let field = Field::new("uid", DataType::Boolean, true);
        let other = encode_column(&field, Arc::new(arrow::array::BooleanArray::from(vec![true]))).unwrap();

        let mut merger = ColumnMerger::new(&operand(&[1])).unwrap();
        assert_eq!(merger.merge_newer(&other).unwrap_err().kind, ErrorKind::Corruption);
    }

    #[test]
    fn field_is_read_from_the_header() {
        let field = decode_field(&operand(&[1, 2, 3])).unwrap();
        assert_eq!((field.name().as_str(), field.data_type()), ("uid", &DataType::UInt64));
        assert!(decode_field(b"not arrow").is_err());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_column(b"not arrow").is_err());
    }
}
