mod bulk_item;
mod ca_record;
mod raw_event;

pub use bulk_item::{AbandonedItem, BulkItem, ClassifiedEvent, InvalidItem};
pub use ca_record::{CaEnvelope, CaRecord, InteractionRecord, LogRecord};
pub use raw_event::{PartitionId, PropertyValue, RawEvent};
