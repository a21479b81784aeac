use crate::{
    database::KeyValueDatabase,
    service::rooms::refs::{Data, RefKind},
    utils, Result,
};

impl Data for KeyValueDatabase {
    fn referrers(&self, idx: u64, kind: RefKind) -> Result<Vec<u64>> {
        let mut prefix = idx.to_be_bytes().to_vec();
        prefix.push(kind as u8);

        let mut found = Vec::new();
        for (key, _) in self.eventrefs.scan_prefix(prefix) {
            let referrer = utils::u64_from_bytes(&key[key.len() - 8..])?;
            found.push(referrer);
        }
        Ok(found)
    }
}
