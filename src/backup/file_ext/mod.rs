/// Supplies the extension tag appended to a backup file name, leading dot included.
pub trait FileExtProvider {
    fn file_ext(&self) -> &'static str;
}
