mod connection_test;
