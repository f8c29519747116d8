mod quota_recovery;
