//! Copy values between signal memory and value tree leaves
//!
//! The copy itself is generic over the signal's numeric type. The only place
//! the runtime type tag is inspected is the switch in [`read_leaf`] and
//! [`write_leaf`].

use thiserror::Error;

use crate::{
    pvdata::{ConvertError, FieldKind, PvField, PvNumeric, ScalarType, with_numeric_type},
    signal::CachedSignal,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("signals of type {0} cannot be transferred")]
    Unsupported(ScalarType),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("expected a {expected} field, found a {found}")]
    Shape { expected: FieldKind, found: FieldKind },
}

fn expected_kind(signal: &CachedSignal) -> FieldKind {
    if signal.elements() == 1 {
        FieldKind::Scalar
    } else {
        FieldKind::ScalarArray
    }
}

/// Copy a leaf value into the signal's memory
pub fn read_leaf(signal: &CachedSignal, leaf: &PvField) -> Result<(), TransferError> {
    with_numeric_type!(signal.signal_type(), T => copy_from_leaf::<T>(signal, leaf),
        Err(TransferError::Unsupported(signal.signal_type())))
}

/// Copy the signal's memory into a leaf, keeping the leaf's type
pub fn write_leaf(signal: &CachedSignal, leaf: &mut PvField) -> Result<(), TransferError> {
    with_numeric_type!(signal.signal_type(), T => copy_to_leaf::<T>(signal, leaf),
        Err(TransferError::Unsupported(signal.signal_type())))
}

fn copy_from_leaf<T: PvNumeric>(
    signal: &CachedSignal,
    leaf: &PvField,
) -> Result<(), TransferError> {
    let memory = signal.memory();
    match (leaf, signal.elements()) {
        (PvField::Scalar(value), 1) => memory.store(0, value.to::<T>()?),
        (PvField::ScalarArray(values), n) if n > 1 => {
            // Arrays shorter than the signal only update their prefix
            let mut buffer = vec![T::default(); n as usize];
            let count = values.copy_to(&mut buffer)?;
            memory.store_slice(&buffer[..count]);
        }
        (other, _) => {
            return Err(TransferError::Shape {
                expected: expected_kind(signal),
                found: other.kind(),
            });
        }
    }
    Ok(())
}

fn copy_to_leaf<T: PvNumeric>(
    signal: &CachedSignal,
    leaf: &mut PvField,
) -> Result<(), TransferError> {
    let memory = signal.memory();
    match (leaf, signal.elements()) {
        (PvField::Scalar(value), 1) => value.assign(memory.load::<T>(0))?,
        (PvField::ScalarArray(values), n) if n > 1 => values.assign(&memory.to_vec::<T>())?,
        (other, _) => {
            return Err(TransferError::Shape {
                expected: expected_kind(signal),
                found: other.kind(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pvdata::{ScalarArray, ScalarValue},
        signal::SignalMemory,
    };

    fn signal(signal_type: ScalarType, elements: usize) -> CachedSignal {
        CachedSignal::new("value", "R", SignalMemory::new(signal_type, elements))
    }

    #[test]
    fn scalar_read_and_write() {
        let s = signal(ScalarType::I64, 1);
        read_leaf(&s, &PvField::from(-42i32)).unwrap();
        assert_eq!(s.memory().load::<i64>(0), -42);

        let mut leaf = PvField::from(0i16);
        write_leaf(&s, &mut leaf).unwrap();
        assert_eq!(leaf, PvField::from(-42i16));

        let mut unsigned = PvField::from(0u8);
        assert_eq!(
            write_leaf(&s, &mut unsigned),
            Err(TransferError::Convert(ConvertError {
                from: ScalarType::I64,
                to: ScalarType::U8
            }))
        );
    }

    #[test]
    fn array_read_and_write() {
        let s = signal(ScalarType::F32, 4);
        read_leaf(&s, &PvField::from(vec![1.0f64, 2.0, 3.0, 4.0, 5.0])).unwrap();
        assert_eq!(s.memory().to_vec::<f32>(), vec![1.0, 2.0, 3.0, 4.0]);

        read_leaf(&s, &PvField::from(vec![9u8, 8])).unwrap();
        assert_eq!(s.memory().to_vec::<f32>(), vec![9.0, 8.0, 3.0, 4.0]);

        let mut leaf = PvField::ScalarArray(ScalarArray::zeroed(ScalarType::F64, 0));
        write_leaf(&s, &mut leaf).unwrap();
        assert_eq!(leaf, PvField::from(vec![9.0f64, 8.0, 3.0, 4.0]));
    }

    #[test]
    fn shape_mismatch() {
        let s = signal(ScalarType::U16, 1);
        assert_eq!(
            read_leaf(&s, &PvField::from(vec![1u16, 2])),
            Err(TransferError::Shape {
                expected: FieldKind::Scalar,
                found: FieldKind::ScalarArray
            })
        );
        let a = signal(ScalarType::U16, 2);
        assert!(read_leaf(&a, &PvField::from(ScalarValue::U16(1))).is_err());
    }

    #[test]
    fn strings_are_not_transferred() {
        let s = signal(ScalarType::String, 1);
        assert_eq!(
            read_leaf(&s, &PvField::from("text")),
            Err(TransferError::Unsupported(ScalarType::String))
        );
        let mut leaf = PvField::from("text");
        assert!(write_leaf(&s, &mut leaf).is_err());
    }
}
