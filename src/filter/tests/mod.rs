mod tests_bloom;
mod tests_bitmap;
mod tests_dispatch;
